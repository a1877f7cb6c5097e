//! Checkpointing and recovery.
//!
//! A checkpoint names the last token a run finished, the node it reached
//! and, when aggregations hold rows, the tagged-encoded buffer contents.
//! Recovery reads the latest checkpoint back and hands the orchestrator
//! every row past it with its original payload and types.

mod manager;
mod recovery;

pub use manager::CheckpointManager;
pub use recovery::{RecoveryManager, ResumePoint};

use crate::contracts::ContractViolation;
use crate::landscape::{LandscapeError, RunStatus};
use thiserror::Error;

/// Why a run cannot be resumed.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The run never wrote a checkpoint.
    #[error("run '{run_id}' has no checkpoint")]
    NoCheckpoint {
        /// Run identifier.
        run_id: String,
    },

    /// The source declares no schema, so stored rows cannot be restored
    /// with their types.
    #[error("source of run '{run_id}' declares no schema; cannot restore row types")]
    MissingSourceSchema {
        /// Run identifier.
        run_id: String,
    },

    /// A row past the checkpoint lost its payload to retention.
    #[error("payload for row '{row_id}' has been purged; run cannot be resumed")]
    PayloadPurged {
        /// Row whose payload is gone.
        row_id: String,
    },

    /// The run is not failed or interrupted.
    #[error("run '{run_id}' is {status}, not resumable")]
    RunNotResumable {
        /// Run identifier.
        run_id: String,
        /// Current status.
        status: RunStatus,
    },

    /// A stored row no longer matches the source schema.
    #[error(transparent)]
    Contract(#[from] ContractViolation),

    /// Ledger failure.
    #[error(transparent)]
    Landscape(LandscapeError),
}

impl From<LandscapeError> for RecoveryError {
    fn from(err: LandscapeError) -> Self {
        match err {
            LandscapeError::PayloadPurged { row_id } => Self::PayloadPurged { row_id },
            other => Self::Landscape(other),
        }
    }
}
