//! Operation tracker for source loads and sink writes.

use crate::landscape::{Landscape, LandscapeError, Operation, OperationStatus, OperationType};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// How a tracked operation finished, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome<T> {
    /// The work is done.
    Completed(T),
    /// Work was submitted and must be polled later. Not a failure.
    Pending(T),
}

impl<T> OperationOutcome<T> {
    /// The carried value.
    pub fn into_inner(self) -> T {
        match self {
            Self::Completed(value) | Self::Pending(value) => value,
        }
    }

    /// Whether the operation is still outstanding.
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    const fn status(&self) -> OperationStatus {
        match self {
            Self::Completed(_) => OperationStatus::Completed,
            Self::Pending(_) => OperationStatus::Pending,
        }
    }
}

#[derive(Debug)]
struct Inner {
    landscape: Arc<Landscape>,
    operation_id: String,
    started: Instant,
    metadata: Mutex<Option<Value>>,
    completed: AtomicBool,
}

impl Inner {
    fn finish(
        &self,
        status: OperationStatus,
        error_message: Option<&str>,
    ) -> Result<Operation, LandscapeError> {
        self.completed.store(true, Ordering::SeqCst);
        let metadata = self.metadata.lock().clone();
        self.landscape.complete_operation(
            &self.operation_id,
            status,
            metadata.as_ref(),
            error_message,
            self.started.elapsed().as_secs_f64() * 1000.0,
        )
    }
}

/// Access to the open operation from inside the tracked body.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    inner: Arc<Inner>,
}

impl OperationHandle {
    /// The open operation's identifier.
    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.inner.operation_id
    }

    /// Attaches metadata written with the completion record.
    pub fn set_metadata(&self, metadata: Value) {
        *self.inner.metadata.lock() = Some(metadata);
    }
}

struct Guard {
    inner: Arc<Inner>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.inner.completed.load(Ordering::SeqCst) {
            return;
        }
        let message = if std::thread::panicking() {
            "operation panicked"
        } else {
            "operation was abandoned before completion"
        };
        if let Err(e) = self.inner.finish(OperationStatus::Failed, Some(message)) {
            error!(
                operation_id = %self.inner.operation_id,
                error = %e,
                "failed to record abandoned operation"
            );
        }
    }
}

/// Runs `body` inside an open operation record.
///
/// `Ok(Completed)` writes COMPLETED and `Ok(Pending)` writes PENDING, both
/// with any metadata set through the handle. An error from `body` writes
/// FAILED with its message and is returned unchanged; a failure of that
/// write is only logged. A failure to write the record after `body`
/// succeeded is returned, because a successful operation without an audit
/// record must not pass.
///
/// # Errors
///
/// Returns the body's error, or a [`LandscapeError`] if the record cannot
/// be opened or completed after success.
pub async fn track_operation<T, E, F, Fut>(
    landscape: &Arc<Landscape>,
    run_id: &str,
    node_id: &str,
    operation_type: OperationType,
    body: F,
) -> Result<OperationOutcome<T>, E>
where
    E: Display + From<LandscapeError>,
    F: FnOnce(OperationHandle) -> Fut,
    Fut: Future<Output = Result<OperationOutcome<T>, E>>,
{
    let op = landscape.begin_operation(run_id, node_id, operation_type)?;
    let inner = Arc::new(Inner {
        landscape: Arc::clone(landscape),
        operation_id: op.operation_id,
        started: Instant::now(),
        metadata: Mutex::new(None),
        completed: AtomicBool::new(false),
    });
    let guard = Guard {
        inner: Arc::clone(&inner),
    };

    let result = body(OperationHandle { inner }).await;
    let inner = &guard.inner;
    match result {
        Ok(outcome) => {
            inner.finish(outcome.status(), None)?;
            if outcome.is_pending() {
                debug!(operation_id = %inner.operation_id, node_id, "operation pending");
            }
            Ok(outcome)
        }
        Err(err) => {
            if let Err(e) = inner.finish(OperationStatus::Failed, Some(&err.to_string())) {
                error!(
                    operation_id = %inner.operation_id,
                    error = %e,
                    original = %err,
                    "failed to record operation failure"
                );
            }
            Err(err)
        }
    }
}
