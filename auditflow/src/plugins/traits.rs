//! Plugin role traits.

use super::PluginContext;
use crate::contracts::SchemaContract;
use crate::errors::PluginError;
use crate::landscape::Determinism;
use crate::values::{RowData, RowValue};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;

/// Behavior shared by every plugin.
#[async_trait]
pub trait Plugin: Send + Sync + Debug {
    /// Plugin name, used in node ids.
    fn name(&self) -> &str;

    /// Plugin version recorded on the node.
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Determinism class, which drives the run's reproducibility grade.
    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    /// Configuration snapshot, hashed into the node record.
    fn config(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    /// Called once before the run processes rows.
    async fn on_start(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once after all rows are processed.
    async fn on_complete(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Releases resources. Called on every exit path.
    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// One row produced by a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRow {
    /// A row to validate and process.
    Valid(RowData),
    /// Input the source itself could not parse.
    Quarantined {
        /// The raw input, as much of it as survived.
        raw: RowValue,
        /// Why it was rejected.
        reason: String,
    },
}

/// Loads external rows.
#[async_trait]
pub trait Source: Plugin {
    /// The declared contract. Required to resume a run; without it the
    /// contract is observed from the first row.
    fn schema(&self) -> Option<SchemaContract> {
        None
    }

    /// Where invalid rows go: a sink name, or `discard`.
    fn on_validation_failure(&self) -> &str {
        "discard"
    }

    /// Loads all rows.
    async fn load(&self, ctx: &PluginContext) -> Result<Vec<SourceRow>, PluginError>;
}

/// Result of processing one row.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformResult {
    /// One output row.
    Success(RowData),
    /// Several output rows; the input token is expanded.
    Multi(Vec<RowData>),
    /// Processing failed.
    Error {
        /// Failure detail, recorded with the transform error.
        reason: Value,
        /// Whether a retry might succeed.
        retryable: bool,
    },
    /// Work was submitted and must be polled later. Not a failure.
    Pending,
}

impl TransformResult {
    /// A non-retryable error with a message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            reason: serde_json::json!({ "message": message.into() }),
            retryable: false,
        }
    }

    /// A retryable error with a message.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Error {
            reason: serde_json::json!({ "message": message.into() }),
            retryable: true,
        }
    }
}

/// Processes one row at a time.
#[async_trait]
pub trait Transform: Plugin {
    /// Processes a row.
    async fn process(&self, row: &RowData, ctx: &PluginContext) -> TransformResult;
}

/// Processes buffered rows together once a count trigger fires.
#[async_trait]
pub trait BatchTransform: Plugin {
    /// Processes a batch. `Success` collapses it into one row, `Multi`
    /// produces several.
    async fn process_batch(&self, rows: &[RowData], ctx: &PluginContext) -> TransformResult;
}

/// A routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Proceed to the next step.
    Continue,
    /// Leave the pipeline through the route with this label.
    Route(String),
    /// Copy the token onto each named branch.
    Fork(Vec<String>),
}

/// Decides where a token goes next.
#[async_trait]
pub trait Gate: Plugin {
    /// Evaluates a row.
    async fn evaluate(&self, row: &RowData, ctx: &PluginContext)
        -> Result<GateDecision, PluginError>;
}

/// Result of a sink write.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkWrite {
    /// Rows are durably written. Metadata is recorded on the operation.
    Completed(Value),
    /// Rows were submitted and must be polled later.
    Pending,
}

/// Writes rows out of the pipeline.
#[async_trait]
pub trait Sink: Plugin {
    /// Writes rows.
    async fn write(&self, rows: &[RowData], ctx: &PluginContext) -> Result<SinkWrite, PluginError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landscape::{Landscape, NodeRegistration, NodeType};
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct Bare;

    #[async_trait]
    impl Plugin for Bare {
        fn name(&self) -> &str {
            "bare"
        }
    }

    #[test]
    fn test_default_config_registers() {
        let plugin = Bare;
        assert_eq!(plugin.config(), Value::Object(serde_json::Map::new()));

        let landscape = Landscape::open_in_memory().unwrap();
        let run = landscape.begin_run(&serde_json::json!({})).unwrap();
        let node = landscape
            .register_node(
                &run.run_id,
                NodeRegistration::new("step0::bare", plugin.name(), NodeType::Transform, plugin.determinism())
                    .with_config(plugin.config()),
            )
            .unwrap();
        assert_eq!(node.config_json, plugin.config());
    }
}
