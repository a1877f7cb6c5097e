//! Run execution.
//!
//! - [`Pipeline`] is the validated graph: one source, ordered steps, named
//!   sinks.
//! - [`TokenProcessor`] moves the tokens of one row through the steps.
//! - [`Orchestrator`] owns whole runs: source loading, the worker pool,
//!   checkpoints, shutdown and resume.

mod orchestrator;
mod pipeline;
mod processor;
mod summary;
mod token;

#[cfg(test)]
mod integration_tests;

pub use orchestrator::Orchestrator;
pub use pipeline::{
    EdgeSpec, MergePolicy, Pipeline, PipelineBuilder, PluginHandle, Step, CONTINUE_LABEL,
    DISCARD, ON_ERROR_LABEL, QUARANTINE_LABEL,
};
pub use processor::{RowReport, TokenProcessor};
pub use summary::{RunCounters, RunResult, RunResultStatus, RunSummary, TokenDisposition};
pub use token::TokenInfo;
