//! Resuming failed and interrupted runs.

use super::RecoveryError;
use crate::contracts::{RowSchema, SchemaContract};
use crate::landscape::{Checkpoint, Landscape, Row};
use crate::values::RowData;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a resumed run picks up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    /// Latest checkpoint.
    pub checkpoint: Checkpoint,
    /// Source index of the checkpoint token's row. Rows after it are
    /// unprocessed.
    pub row_index: i64,
    /// Aggregation buffers captured with the checkpoint.
    pub aggregation_state: Option<Value>,
}

/// Reads checkpoints and unprocessed rows back out of the ledger.
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    landscape: Arc<Landscape>,
}

impl RecoveryManager {
    /// Creates a manager over `landscape`.
    #[must_use]
    pub const fn new(landscape: Arc<Landscape>) -> Self {
        Self { landscape }
    }

    /// Checks that `run_id` is failed or interrupted and has a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::RunNotResumable`] or
    /// [`RecoveryError::NoCheckpoint`].
    pub fn check_resumable(&self, run_id: &str) -> Result<(), RecoveryError> {
        let run = self.landscape.get_run(run_id)?;
        if !run.status.is_resumable() {
            return Err(RecoveryError::RunNotResumable {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        if self.landscape.get_latest_checkpoint(run_id)?.is_none() {
            return Err(RecoveryError::NoCheckpoint {
                run_id: run_id.to_string(),
            });
        }
        Ok(())
    }

    /// Whether [`RecoveryManager::check_resumable`] passes.
    #[must_use]
    pub fn can_resume(&self, run_id: &str) -> bool {
        self.check_resumable(run_id).is_ok()
    }

    /// The latest checkpoint and the row position it covers.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::NoCheckpoint`] if there is none, or a
    /// ledger error if the checkpoint's token is missing.
    pub fn get_resume_point(&self, run_id: &str) -> Result<ResumePoint, RecoveryError> {
        let checkpoint = self
            .landscape
            .get_latest_checkpoint(run_id)?
            .ok_or_else(|| RecoveryError::NoCheckpoint {
                run_id: run_id.to_string(),
            })?;
        let token = self.landscape.get_token(&checkpoint.token_id)?;
        let row = self.landscape.get_row(&token.row_id)?;
        Ok(ResumePoint {
            aggregation_state: checkpoint.aggregation_state.clone(),
            checkpoint,
            row_index: row.row_index,
        })
    }

    /// Rows after the checkpoint, in source order.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::NoCheckpoint`] if there is no checkpoint.
    pub fn get_unprocessed_rows(&self, run_id: &str) -> Result<Vec<Row>, RecoveryError> {
        let point = self.get_resume_point(run_id)?;
        let mut rows: Vec<Row> = self
            .landscape
            .get_rows(run_id)?
            .into_iter()
            .filter(|r| r.row_index > point.row_index)
            .collect();
        rows.sort_by_key(|r| r.row_index);
        debug!(run_id, after = point.row_index, rows = rows.len(), "unprocessed rows");
        Ok(rows)
    }

    /// Rows after the checkpoint with their original payloads, checked
    /// against the source schema.
    ///
    /// The schema is required: without it a stored timestamp could come
    /// back as loose text. An unlocked schema is finalized with the first
    /// unprocessed row.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::MissingSourceSchema`] if `schema` is
    /// `None`, [`RecoveryError::PayloadPurged`] if any payload is gone,
    /// and [`RecoveryError::Contract`] if a payload no longer matches.
    pub fn get_unprocessed_row_data(
        &self,
        run_id: &str,
        schema: Option<&SchemaContract>,
    ) -> Result<Vec<(Row, RowData)>, RecoveryError> {
        let schema = schema.ok_or_else(|| RecoveryError::MissingSourceSchema {
            run_id: run_id.to_string(),
        })?;
        let rows = self.get_unprocessed_rows(run_id)?;
        let mut restored = Vec::with_capacity(rows.len());
        let mut contract: Option<RowSchema> = None;
        for row in rows {
            let data = self.landscape.get_row_data(&row.row_id)?;
            let contract = contract.get_or_insert_with(|| {
                let finalized = if schema.is_locked() {
                    schema.clone()
                } else {
                    schema.finalize_with_row(&data)
                };
                RowSchema::for_pipeline(finalized)
            });
            let data = contract.check(&row.source_node_id, &data)?;
            restored.push((row, data));
        }
        info!(run_id, rows = restored.len(), "restored unprocessed rows");
        Ok(restored)
    }
}
