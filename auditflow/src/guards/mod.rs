//! Scoped guards that guarantee terminal audit records.
//!
//! - [`run_in_node_state`] brackets one attempt of one token at one node.
//! - [`track_operation`] brackets a source load or sink write.
//!
//! Both write a terminal record on every exit path: explicit completion,
//! an error returned by the body, a panic, or the future being dropped.
//! The body's own error always wins over a failure to write the record.

mod operation;
mod state_guard;

pub use operation::{track_operation, OperationHandle, OperationOutcome};
pub use state_guard::{run_in_node_state, NodeStateHandle, StateTarget};

use thiserror::Error;

/// Misuse of a guard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    /// The guarded body returned normally without completing its record.
    #[error("{entity} '{id}' exited without being completed")]
    NotCompleted {
        /// `node_state` or `operation`.
        entity: &'static str,
        /// Record identifier.
        id: String,
    },
}
