//! Checkpoint cadence and writing.

use crate::landscape::{Checkpoint, Landscape, LandscapeError};
use crate::settings::{CheckpointFrequency, CheckpointSettings};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
struct Cadence {
    next_sequence: i64,
    rows_since: u64,
    touched_aggregation: bool,
    last_written: Instant,
}

/// Decides when a run is due for a checkpoint and writes it.
///
/// Sequence numbers continue from the run's latest checkpoint, so a
/// resumed run never reuses one.
#[derive(Debug)]
pub struct CheckpointManager {
    landscape: Arc<Landscape>,
    run_id: String,
    settings: CheckpointSettings,
    cadence: Mutex<Cadence>,
}

impl CheckpointManager {
    /// Creates a manager for `run_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the latest checkpoint cannot be read.
    pub fn new(
        landscape: Arc<Landscape>,
        run_id: impl Into<String>,
        settings: CheckpointSettings,
    ) -> Result<Self, LandscapeError> {
        let run_id = run_id.into();
        let next_sequence = landscape
            .get_latest_checkpoint(&run_id)?
            .map_or(1, |c| c.sequence_number + 1);
        Ok(Self {
            landscape,
            run_id,
            settings,
            cadence: Mutex::new(Cadence {
                next_sequence,
                rows_since: 0,
                touched_aggregation: false,
                last_written: Instant::now(),
            }),
        })
    }

    /// Whether checkpoints are written at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Sequence number the next checkpoint will get.
    #[must_use]
    pub fn next_sequence(&self) -> i64 {
        self.cadence.lock().next_sequence
    }

    /// Counts `rows` newly finished rows and reports whether a checkpoint
    /// is now due.
    pub fn note_progress(&self, rows: u64, touched_aggregation: bool) -> bool {
        if !self.settings.enabled {
            return false;
        }
        let mut cadence = self.cadence.lock();
        cadence.rows_since += rows;
        cadence.touched_aggregation |= touched_aggregation;
        if cadence.rows_since == 0 {
            return false;
        }
        let by_rows = match self.settings.frequency {
            CheckpointFrequency::EveryRow => true,
            CheckpointFrequency::EveryN(n) => cadence.rows_since >= n,
            CheckpointFrequency::AggregationOnly => cadence.touched_aggregation,
        };
        let by_time = self
            .settings
            .interval_secs
            .is_some_and(|secs| cadence.last_written.elapsed() >= Duration::from_secs(secs));
        by_rows || by_time
    }

    /// Writes a checkpoint and resets the cadence.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger write fails.
    pub fn write(
        &self,
        token_id: &str,
        node_id: &str,
        aggregation_state: Option<&Value>,
    ) -> Result<Checkpoint, LandscapeError> {
        let mut cadence = self.cadence.lock();
        let checkpoint = self.landscape.record_checkpoint(
            &self.run_id,
            token_id,
            node_id,
            cadence.next_sequence,
            aggregation_state,
        )?;
        cadence.next_sequence += 1;
        cadence.rows_since = 0;
        cadence.touched_aggregation = false;
        cadence.last_written = Instant::now();
        debug!(
            run_id = %self.run_id,
            token_id,
            node_id,
            sequence = checkpoint.sequence_number,
            "checkpoint written"
        );
        Ok(checkpoint)
    }
}
