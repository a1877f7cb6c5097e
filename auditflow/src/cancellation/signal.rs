//! Shutdown flag and signal handling.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Exit code used when a second signal forces an unclean exit.
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Default)]
struct Inner {
    requested: AtomicBool,
    signals: AtomicU32,
    reason: RwLock<Option<String>>,
}

/// Shared shutdown flag. Clones observe the same state.
///
/// Only the first reason is kept.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a graceful shutdown.
    pub fn request(&self, reason: impl Into<String>) {
        if self
            .inner
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.inner.reason.write() = Some(reason.into());
        }
    }

    /// Counts a received signal and requests shutdown. Returns how many
    /// signals have been received so far.
    pub fn note_signal(&self, reason: impl Into<String>) -> u32 {
        self.request(reason);
        self.inner.signals.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Number of signals received.
    #[must_use]
    pub fn signal_count(&self) -> u32 {
        self.inner.signals.load(Ordering::SeqCst)
    }

    /// The first shutdown reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("requested", &self.is_requested())
            .field("signals", &self.signal_count())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Spawns a task that feeds Ctrl-C into `signal`.
///
/// The first Ctrl-C requests a graceful shutdown. The second exits the
/// process with code 130. Must be called inside a tokio runtime.
pub fn install_signal_handlers(signal: &ShutdownSignal) -> tokio::task::JoinHandle<()> {
    let signal = signal.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for shutdown signals");
                return;
            }
            if signal.note_signal("interrupt signal received") >= 2 {
                error!("second interrupt signal, exiting immediately");
                std::process::exit(FORCED_EXIT_CODE);
            }
            warn!("interrupt received, finishing in-flight rows; press Ctrl-C again to force exit");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_not_requested() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_requested());
        assert_eq!(signal.reason(), None);
    }

    #[test]
    fn test_first_reason_wins_and_clones_share_state() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();
        signal.request("first");
        signal.request("second");
        assert!(observer.is_requested());
        assert_eq!(observer.reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_signal_counting() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.note_signal("sigint"), 1);
        assert_eq!(signal.note_signal("sigint"), 2);
        assert_eq!(signal.signal_count(), 2);
        assert!(signal.is_requested());
    }
}
