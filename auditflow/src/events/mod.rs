//! Telemetry events.
//!
//! Events are operational signals for dashboards and logs. They are never
//! the audit record; the Landscape is. The orchestrator receives an
//! [`EventSink`] explicitly and emits the names in [`names`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event names emitted by the engine.
pub mod names {
    /// A run began.
    pub const RUN_STARTED: &str = "run.started";
    /// A run finished, in any status.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// A failed or interrupted run is being resumed.
    pub const RUN_RESUMED: &str = "run.resumed";
    /// The source finished loading.
    pub const SOURCE_LOADED: &str = "source.loaded";
    /// A row was quarantined at the source boundary.
    pub const ROW_QUARANTINED: &str = "row.quarantined";
    /// A token reached a terminal outcome.
    pub const TOKEN_COMPLETED: &str = "token.completed";
    /// A transform attempt is being retried.
    pub const TOKEN_RETRYING: &str = "token.retrying";
    /// An aggregation buffer was flushed.
    pub const BATCH_FLUSHED: &str = "batch.flushed";
    /// A checkpoint was written.
    pub const CHECKPOINT_WRITTEN: &str = "checkpoint.written";
}
