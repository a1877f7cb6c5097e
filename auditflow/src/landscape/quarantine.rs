//! Validation and transform error records.

use super::{Landscape, Result, TransformErrorRecord, ValidationErrorRecord};
use crate::canonical::{encode_tagged, repr_hash, safe_repr, stable_hash};
use crate::contracts::ContractMode;
use crate::utils::{generate_id, now_utc};
use crate::values::{RowData, RowValue};
use rusqlite::params;
use tracing::warn;

/// Hash and stored form of a row that may not be canonically encodable.
/// Falls back to a repr so quarantine never fails on bad input.
fn quarantine_form(row: &RowValue) -> (String, serde_json::Value) {
    match (stable_hash(row), encode_tagged(row)) {
        (Ok(hash), Ok(encoded)) => (hash, encoded),
        _ => (
            repr_hash(row),
            serde_json::json!({ "__repr__": safe_repr(row) }),
        ),
    }
}

impl Landscape {
    /// Records external input that failed validation at a source.
    ///
    /// Non-encodable rows (NaN, infinities) are stored as
    /// `{"__repr__": ...}` with a repr hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn record_validation_error(
        &self,
        run_id: &str,
        node_id: Option<&str>,
        row: &RowValue,
        error: &str,
        schema_mode: ContractMode,
        destination: &str,
    ) -> Result<ValidationErrorRecord> {
        let (row_hash, row_data) = quarantine_form(row);
        let record = ValidationErrorRecord {
            error_id: generate_id(),
            run_id: run_id.to_string(),
            node_id: node_id.map(str::to_string),
            row_hash,
            row_data,
            error: error.to_string(),
            schema_mode: schema_mode.to_string(),
            destination: destination.to_string(),
            created_at: now_utc(),
        };
        self.lock().execute(
            "INSERT INTO validation_errors (error_id, run_id, node_id, row_hash, row_data_json, \
             error, schema_mode, destination, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.error_id,
                record.run_id,
                record.node_id,
                record.row_hash,
                record.row_data,
                record.error,
                record.schema_mode,
                record.destination,
                record.created_at,
            ],
        )?;
        warn!(run_id, row_hash = %record.row_hash, destination, "row quarantined: {error}");
        Ok(record)
    }

    /// Validation errors recorded for rows with the given content hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_validation_errors_for_row(
        &self,
        run_id: &str,
        row_hash: &str,
    ) -> Result<Vec<ValidationErrorRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM validation_errors WHERE run_id = ?1 AND row_hash = ?2 \
             ORDER BY created_at, error_id",
            ValidationErrorRecord::COLUMNS
        ))?;
        let records = stmt
            .query_map([run_id, row_hash], ValidationErrorRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Every validation error of a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_validation_errors(&self, run_id: &str) -> Result<Vec<ValidationErrorRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM validation_errors WHERE run_id = ?1 ORDER BY created_at, error_id",
            ValidationErrorRecord::COLUMNS
        ))?;
        let records = stmt
            .query_map([run_id], ValidationErrorRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Records a transform's error for a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn record_transform_error(
        &self,
        run_id: &str,
        token_id: &str,
        node_id: &str,
        row: &RowData,
        error_details: &serde_json::Value,
        destination: &str,
    ) -> Result<TransformErrorRecord> {
        let (row_hash, row_data) = quarantine_form(&RowValue::from(row.clone()));
        let record = TransformErrorRecord {
            error_id: generate_id(),
            run_id: run_id.to_string(),
            token_id: token_id.to_string(),
            node_id: node_id.to_string(),
            row_hash,
            row_data,
            error_details: error_details.clone(),
            destination: destination.to_string(),
            created_at: now_utc(),
        };
        self.lock().execute(
            "INSERT INTO transform_errors (error_id, run_id, token_id, node_id, row_hash, \
             row_data_json, error_details_json, destination, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.error_id,
                record.run_id,
                record.token_id,
                record.node_id,
                record.row_hash,
                record.row_data,
                record.error_details,
                record.destination,
                record.created_at,
            ],
        )?;
        Ok(record)
    }

    /// Transform errors recorded for a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_transform_errors_for_token(&self, token_id: &str) -> Result<Vec<TransformErrorRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transform_errors WHERE token_id = ?1 ORDER BY created_at, error_id",
            TransformErrorRecord::COLUMNS
        ))?;
        let records = stmt
            .query_map([token_id], TransformErrorRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
