//! # Auditflow
//!
//! The audited token-execution core of a row-oriented data pipeline.
//!
//! Every source row becomes a token that moves through transforms, gates,
//! aggregations and coalesce points to a sink. Each step is recorded in
//! the Landscape, an append-only lineage ledger, so any output can be
//! traced back to its input and every plugin decision along the way:
//!
//! - **Schema contracts**: typed field descriptions that travel with rows
//! - **Guards**: every plugin call ends in exactly one terminal record
//! - **Retries**: transient failures retried with audited attempts
//! - **Checkpoints**: interrupted runs resume past the last finished row
//! - **Canonical hashing**: stable content hashes and type-preserving
//!   checkpoint encoding
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use auditflow::prelude::*;
//!
//! let pipeline = Pipeline::builder("orders")
//!     .source(Arc::new(CsvSource::new("orders.csv")))
//!     .transform(Arc::new(NormalizeCurrency::new()))
//!     .sink(Arc::new(ParquetSink::new("out")))
//!     .build()?;
//!
//! let landscape = Arc::new(Landscape::open_in_memory()?);
//! let result = Orchestrator::new(landscape, EngineSettings::default())?
//!     .run(pipeline)
//!     .await?;
//! println!("{} rows succeeded", result.counters().rows_succeeded);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod canonical;
pub mod checkpoint;
pub mod contracts;
pub mod engine;
pub mod errors;
pub mod events;
pub mod guards;
pub mod landscape;
pub mod observability;
pub mod plugins;
pub mod retry;
pub mod settings;
pub mod testing;
pub mod utils;
pub mod values;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{install_signal_handlers, ShutdownSignal};
    pub use crate::canonical::{canonical_json, stable_hash, CanonicalError};
    pub use crate::checkpoint::{CheckpointManager, RecoveryError, RecoveryManager};
    pub use crate::contracts::{
        ContractMode, ContractViolation, FieldContract, FieldType, SchemaContract,
    };
    pub use crate::engine::{
        MergePolicy, Orchestrator, Pipeline, PipelineBuilder, RunCounters, RunResult,
        RunResultStatus, RunSummary,
    };
    pub use crate::errors::{AuditflowError, GracefulShutdownError, PluginError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::landscape::{
        Determinism, Landscape, LandscapeError, LineageQuery, ReproducibilityGrade, RowOutcome,
        RunStatus,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::plugins::{
        BatchTransform, Gate, GateDecision, Plugin, PluginContext, PluginRegistry, Sink,
        SinkWrite, Source, SourceRow, Transform, TransformResult,
    };
    pub use crate::retry::{RetryConfig, RetryManager};
    pub use crate::settings::EngineSettings;
    pub use crate::values::{RowData, RowValue};
}
