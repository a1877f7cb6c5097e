//! Node-state guard.

use super::GuardError;
use crate::errors::ErrorKind;
use crate::landscape::{
    ExecutionError, Landscape, LandscapeError, NodeState, NodeStateStatus,
};
use crate::values::{RowData, RowValue};
use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Which token, node and attempt a guarded region processes.
#[derive(Debug, Clone, Copy)]
pub struct StateTarget<'a> {
    /// Owning run.
    pub run_id: &'a str,
    /// Token being processed.
    pub token_id: &'a str,
    /// Node processing it.
    pub node_id: &'a str,
    /// Step index of the node.
    pub step_index: i64,
    /// Attempt number, starting at 1.
    pub attempt: i64,
}

#[derive(Debug)]
struct Inner {
    landscape: Arc<Landscape>,
    state_id: String,
    started: Instant,
    phase: Mutex<String>,
    completed: AtomicBool,
}

impl Inner {
    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn write_failed(&self, kind: &str, message: &str) -> Result<NodeState, LandscapeError> {
        let detail = ExecutionError::new(kind, message).with_phase(self.phase.lock().clone());
        self.completed.store(true, Ordering::SeqCst);
        self.landscape.complete_node_state(
            &self.state_id,
            NodeStateStatus::Failed,
            None,
            Some(&detail),
            self.elapsed_ms(),
        )
    }
}

/// Access to the open node state from inside the guarded body.
#[derive(Debug, Clone)]
pub struct NodeStateHandle {
    inner: Arc<Inner>,
}

impl NodeStateHandle {
    /// The open node state's identifier.
    #[must_use]
    pub fn state_id(&self) -> &str {
        &self.inner.state_id
    }

    /// Sets the phase marker recorded if the body fails.
    pub fn set_phase(&self, phase: impl Into<String>) {
        *self.inner.phase.lock() = phase.into();
    }

    /// Whether the state has been completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Completes the state with a terminal status.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger write fails or the state is already
    /// terminal.
    pub fn complete(
        &self,
        status: NodeStateStatus,
        output: Option<&RowValue>,
        error: Option<&ExecutionError>,
    ) -> Result<NodeState, LandscapeError> {
        self.inner.completed.store(true, Ordering::SeqCst);
        self.inner.landscape.complete_node_state(
            &self.inner.state_id,
            status,
            output,
            error,
            self.inner.elapsed_ms(),
        )
    }

    /// Completes the state as COMPLETED with an output.
    ///
    /// # Errors
    ///
    /// See [`NodeStateHandle::complete`].
    pub fn succeed(&self, output: &RowValue) -> Result<NodeState, LandscapeError> {
        self.complete(NodeStateStatus::Completed, Some(output), None)
    }

    /// Completes the state as FAILED with an error detail.
    ///
    /// # Errors
    ///
    /// See [`NodeStateHandle::complete`].
    pub fn fail(&self, error: &ExecutionError) -> Result<NodeState, LandscapeError> {
        self.complete(NodeStateStatus::Failed, None, Some(error))
    }
}

/// Owns the open state and fails it if dropped while still open.
struct Guard {
    inner: Arc<Inner>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.inner.completed.load(Ordering::SeqCst) {
            return;
        }
        let (kind, message) = if std::thread::panicking() {
            ("Panic", "processing panicked")
        } else {
            ("Cancelled", "processing was abandoned before completion")
        };
        if let Err(e) = self.inner.write_failed(kind, message) {
            error!(
                state_id = %self.inner.state_id,
                error = %e,
                "failed to record abandoned node state"
            );
        }
    }
}

/// Runs `body` inside an open node state.
///
/// The state is opened before `body` runs. `body` must complete it through
/// the [`NodeStateHandle`]. If `body` returns an error without completing,
/// the state is completed as FAILED with the error's kind, message and the
/// current phase, and the original error is returned. If that write fails
/// it is logged and the original error is still returned. A panic or a
/// dropped future also leaves a FAILED record.
///
/// # Errors
///
/// Returns the body's error, a [`LandscapeError`] if the state cannot be
/// opened, or [`GuardError::NotCompleted`] if the body returned `Ok`
/// without completing the state.
pub async fn run_in_node_state<T, E, F, Fut>(
    landscape: &Arc<Landscape>,
    target: StateTarget<'_>,
    input: &RowData,
    body: F,
) -> Result<T, E>
where
    E: ErrorKind + Display + From<LandscapeError> + From<GuardError>,
    F: FnOnce(NodeStateHandle) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let state = landscape.begin_node_state(
        target.run_id,
        target.token_id,
        target.node_id,
        target.step_index,
        target.attempt,
        input,
    )?;
    let inner = Arc::new(Inner {
        landscape: Arc::clone(landscape),
        state_id: state.state_id,
        started: Instant::now(),
        phase: Mutex::new("process".to_string()),
        completed: AtomicBool::new(false),
    });
    let guard = Guard {
        inner: Arc::clone(&inner),
    };
    let handle = NodeStateHandle { inner };

    let result = body(handle).await;
    let inner = &guard.inner;
    match result {
        Ok(value) if inner.completed.load(Ordering::SeqCst) => Ok(value),
        Ok(_) => {
            let message = "guarded body returned without completing its node state";
            if let Err(e) = inner.write_failed("GuardError", message) {
                error!(state_id = %inner.state_id, error = %e, "failed to record node state failure");
            }
            Err(GuardError::NotCompleted {
                entity: "node_state",
                id: inner.state_id.clone(),
            }
            .into())
        }
        Err(err) => {
            if !inner.completed.load(Ordering::SeqCst) {
                if let Err(e) = inner.write_failed(err.kind_name(), &err.to_string()) {
                    error!(
                        state_id = %inner.state_id,
                        error = %e,
                        original = %err,
                        "failed to record node state failure"
                    );
                }
            }
            Err(err)
        }
    }
}
