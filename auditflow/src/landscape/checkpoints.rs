//! Checkpoint records.

use super::{Checkpoint, Landscape, Result};
use crate::utils::{generate_id, now_utc};
use rusqlite::{params, OptionalExtension};

impl Landscape {
    /// Records a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the token does not exist or the sequence number
    /// is already used in this run.
    pub fn record_checkpoint(
        &self,
        run_id: &str,
        token_id: &str,
        node_id: &str,
        sequence_number: i64,
        aggregation_state: Option<&serde_json::Value>,
    ) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            checkpoint_id: generate_id(),
            run_id: run_id.to_string(),
            token_id: token_id.to_string(),
            node_id: node_id.to_string(),
            sequence_number,
            aggregation_state: aggregation_state.cloned(),
            created_at: now_utc(),
        };
        self.lock().execute(
            "INSERT INTO checkpoints (checkpoint_id, run_id, token_id, node_id, sequence_number, \
             aggregation_state_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                checkpoint.checkpoint_id,
                checkpoint.run_id,
                checkpoint.token_id,
                checkpoint.node_id,
                checkpoint.sequence_number,
                checkpoint.aggregation_state,
                checkpoint.created_at,
            ],
        )?;
        Ok(checkpoint)
    }

    /// The checkpoint with the highest sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_latest_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let checkpoint = self
            .lock()
            .query_row(
                &format!(
                    "SELECT {} FROM checkpoints WHERE run_id = ?1 \
                     ORDER BY sequence_number DESC LIMIT 1",
                    Checkpoint::COLUMNS
                ),
                [run_id],
                Checkpoint::from_row,
            )
            .optional()?;
        Ok(checkpoint)
    }

    /// All checkpoints of a run, by sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM checkpoints WHERE run_id = ?1 ORDER BY sequence_number",
            Checkpoint::COLUMNS
        ))?;
        let checkpoints = stmt
            .query_map([run_id], Checkpoint::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(checkpoints)
    }

    /// Deletes a run's checkpoints. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_checkpoints(&self, run_id: &str) -> Result<usize> {
        let removed = self
            .lock()
            .execute("DELETE FROM checkpoints WHERE run_id = ?1", [run_id])?;
        Ok(removed)
    }
}
