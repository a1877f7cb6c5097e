//! Signal-driven shutdown.
//!
//! The first termination signal sets a shared flag that the orchestrator
//! checks between row dispatches; tokens already in flight finish their
//! current node. A second signal exits the process immediately.

mod signal;

pub use signal::{install_signal_handlers, ShutdownSignal};
