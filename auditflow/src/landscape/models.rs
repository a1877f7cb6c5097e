//! Ledger record types.
//!
//! Each struct mirrors one table. `COLUMNS` and `from_row` keep the
//! SELECT lists and the column reads in one place.

use super::enums::{
    CallStatus, CallType, Determinism, NodeStateStatus, NodeType, OperationStatus,
    OperationType, ReproducibilityGrade, RoutingMode, RowOutcome, RunStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

type Timestamp = DateTime<Utc>;

/// One execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub run_id: String,
    /// When the run began.
    pub started_at: Timestamp,
    /// When the run was finalized.
    pub completed_at: Option<Timestamp>,
    /// Canonical hash of the settings snapshot.
    pub config_hash: String,
    /// Settings snapshot as canonical JSON.
    pub settings_json: serde_json::Value,
    /// Version of the canonical encoding used for hashes.
    pub canonical_version: String,
    /// Current status.
    pub status: RunStatus,
    /// Set once at finalization.
    pub reproducibility_grade: Option<ReproducibilityGrade>,
}

impl Run {
    pub(super) const COLUMNS: &'static str = "run_id, started_at, completed_at, config_hash, \
         settings_json, canonical_version, status, reproducibility_grade";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            started_at: row.get(1)?,
            completed_at: row.get(2)?,
            config_hash: row.get(3)?,
            settings_json: row.get(4)?,
            canonical_version: row.get(5)?,
            status: row.get(6)?,
            reproducibility_grade: row.get(7)?,
        })
    }
}

/// A plugin instance registered in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier, unique within the run.
    pub node_id: String,
    /// Owning run.
    pub run_id: String,
    /// Plugin name.
    pub plugin_name: String,
    /// Plugin version.
    pub plugin_version: String,
    /// Role in the pipeline.
    pub node_type: NodeType,
    /// Determinism class.
    pub determinism: Determinism,
    /// Canonical hash of the plugin configuration.
    pub config_hash: String,
    /// Plugin configuration.
    pub config_json: serde_json::Value,
    /// Output schema contract, when the plugin declares one.
    pub schema_json: Option<serde_json::Value>,
    /// Position in the pipeline.
    pub sequence: Option<i64>,
    /// Registration time.
    pub registered_at: Timestamp,
}

impl Node {
    pub(super) const COLUMNS: &'static str = "node_id, run_id, plugin_name, plugin_version, \
         node_type, determinism, config_hash, config_json, schema_json, sequence, registered_at";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            node_id: row.get(0)?,
            run_id: row.get(1)?,
            plugin_name: row.get(2)?,
            plugin_version: row.get(3)?,
            node_type: row.get(4)?,
            determinism: row.get(5)?,
            config_hash: row.get(6)?,
            config_json: row.get(7)?,
            schema_json: row.get(8)?,
            sequence: row.get(9)?,
            registered_at: row.get(10)?,
        })
    }
}

/// Parameters for registering a node.
#[derive(Debug, Clone)]
pub struct NodeRegistration {
    /// Node identifier.
    pub node_id: String,
    /// Plugin name.
    pub plugin_name: String,
    /// Plugin version.
    pub plugin_version: String,
    /// Role.
    pub node_type: NodeType,
    /// Determinism class.
    pub determinism: Determinism,
    /// Plugin configuration.
    pub config: serde_json::Value,
    /// Declared output schema.
    pub schema: Option<serde_json::Value>,
    /// Position in the pipeline.
    pub sequence: Option<i64>,
}

impl NodeRegistration {
    /// Creates a registration with empty configuration.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        plugin_name: impl Into<String>,
        node_type: NodeType,
        determinism: Determinism,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            plugin_name: plugin_name.into(),
            plugin_version: "0.0.0".to_string(),
            node_type,
            determinism,
            config: serde_json::Value::Object(serde_json::Map::new()),
            schema: None,
            sequence: None,
        }
    }

    /// Sets the plugin version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.plugin_version = version.into();
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Sets the declared schema.
    #[must_use]
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Sets the pipeline position.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge identifier.
    pub edge_id: String,
    /// Owning run.
    pub run_id: String,
    /// Upstream node.
    pub from_node_id: String,
    /// Downstream node.
    pub to_node_id: String,
    /// Route label (`continue`, a sink name, a branch name).
    pub label: String,
    /// Routing mode.
    pub default_mode: RoutingMode,
    /// Creation time.
    pub created_at: Timestamp,
}

impl Edge {
    pub(super) const COLUMNS: &'static str =
        "edge_id, run_id, from_node_id, to_node_id, label, default_mode, created_at";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            edge_id: row.get(0)?,
            run_id: row.get(1)?,
            from_node_id: row.get(2)?,
            to_node_id: row.get(3)?,
            label: row.get(4)?,
            default_mode: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

/// One unit of source data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Row identifier.
    pub row_id: String,
    /// Owning run.
    pub run_id: String,
    /// Source node that produced it.
    pub source_node_id: String,
    /// Zero-based position in the source.
    pub row_index: i64,
    /// Canonical hash of the row data.
    pub source_data_hash: String,
    /// Payload store key, if a payload was stored.
    pub source_data_ref: Option<String>,
    /// Whether the payload was deleted by retention.
    pub payload_purged: bool,
    /// Creation time.
    pub created_at: Timestamp,
}

impl Row {
    pub(super) const COLUMNS: &'static str = "row_id, run_id, source_node_id, row_index, \
         source_data_hash, source_data_ref, payload_purged, created_at";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            row_id: row.get(0)?,
            run_id: row.get(1)?,
            source_node_id: row.get(2)?,
            row_index: row.get(3)?,
            source_data_hash: row.get(4)?,
            source_data_ref: row.get(5)?,
            payload_purged: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

/// A unit of in-flight work tied to one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Token identifier.
    pub token_id: String,
    /// Row this token carries.
    pub row_id: String,
    /// Set on siblings created by one fork.
    pub fork_group_id: Option<String>,
    /// Set on the token produced by a coalesce.
    pub join_group_id: Option<String>,
    /// Set on children created by one expansion.
    pub expand_group_id: Option<String>,
    /// Fork branch this token follows.
    pub branch_name: Option<String>,
    /// Step at which the token was created.
    pub step_in_pipeline: Option<i64>,
    /// Creation time.
    pub created_at: Timestamp,
}

impl Token {
    pub(super) const COLUMNS: &'static str = "token_id, row_id, fork_group_id, join_group_id, \
         expand_group_id, branch_name, step_in_pipeline, created_at";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token_id: row.get(0)?,
            row_id: row.get(1)?,
            fork_group_id: row.get(2)?,
            join_group_id: row.get(3)?,
            expand_group_id: row.get(4)?,
            branch_name: row.get(5)?,
            step_in_pipeline: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

/// Parent edge between two tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenParent {
    /// Child token.
    pub token_id: String,
    /// Parent token.
    pub parent_token_id: String,
    /// Position among the child's parents.
    pub ordinal: i64,
}

/// Error detail recorded on a failed node state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Stable error type marker.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Where in processing the failure happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl ExecutionError {
    /// Creates an error detail.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            phase: None,
        }
    }

    /// Sets the phase marker.
    #[must_use]
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

/// One attempt of one token at one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// State identifier.
    pub state_id: String,
    /// Token processed.
    pub token_id: String,
    /// Node processing it.
    pub node_id: String,
    /// Owning run.
    pub run_id: String,
    /// Step index of the node.
    pub step_index: i64,
    /// Attempt number, starting at 1.
    pub attempt: i64,
    /// Status.
    pub status: NodeStateStatus,
    /// Canonical hash of the input row.
    pub input_hash: String,
    /// Payload key of the input snapshot.
    pub input_ref: Option<String>,
    /// Canonical hash of the output.
    pub output_hash: Option<String>,
    /// Payload key of the output snapshot.
    pub output_ref: Option<String>,
    /// Error detail on failure.
    pub error: Option<ExecutionError>,
    /// When processing began.
    pub started_at: Timestamp,
    /// When the state reached a terminal status.
    pub completed_at: Option<Timestamp>,
    /// Processing time.
    pub duration_ms: Option<f64>,
}

impl NodeState {
    pub(super) const COLUMNS: &'static str = "state_id, token_id, node_id, run_id, step_index, \
         attempt, status, input_hash, input_ref, output_hash, output_ref, error_json, \
         started_at, completed_at, duration_ms";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let error_json: Option<serde_json::Value> = row.get(11)?;
        let error = error_json
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
            })?;
        Ok(Self {
            state_id: row.get(0)?,
            token_id: row.get(1)?,
            node_id: row.get(2)?,
            run_id: row.get(3)?,
            step_index: row.get(4)?,
            attempt: row.get(5)?,
            status: row.get(6)?,
            input_hash: row.get(7)?,
            input_ref: row.get(8)?,
            output_hash: row.get(9)?,
            output_ref: row.get(10)?,
            error,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
            duration_ms: row.get(14)?,
        })
    }
}

/// A source-load or sink-write boundary operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation identifier.
    pub operation_id: String,
    /// Owning run.
    pub run_id: String,
    /// Source or sink node.
    pub node_id: String,
    /// Kind.
    pub operation_type: OperationType,
    /// Status.
    pub status: OperationStatus,
    /// Start time.
    pub started_at: Timestamp,
    /// Completion time.
    pub completed_at: Option<Timestamp>,
    /// Metadata attached on completion (row counts, artifact paths).
    pub output_metadata: Option<serde_json::Value>,
    /// Error message on failure.
    pub error_message: Option<String>,
    /// Duration.
    pub duration_ms: Option<f64>,
}

impl Operation {
    pub(super) const COLUMNS: &'static str = "operation_id, run_id, node_id, operation_type, \
         status, started_at, completed_at, output_metadata, error_message, duration_ms";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            operation_id: row.get(0)?,
            run_id: row.get(1)?,
            node_id: row.get(2)?,
            operation_type: row.get(3)?,
            status: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            output_metadata: row.get(7)?,
            error_message: row.get(8)?,
            duration_ms: row.get(9)?,
        })
    }
}

/// What an external call is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallParent {
    /// A per-token node state.
    State(String),
    /// A source or sink operation.
    Operation(String),
}

/// One external call made by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Call identifier.
    pub call_id: String,
    /// Node state the call belongs to.
    pub state_id: Option<String>,
    /// Operation the call belongs to.
    pub operation_id: Option<String>,
    /// Order within its parent.
    pub call_index: i64,
    /// Kind of call.
    pub call_type: CallType,
    /// Result.
    pub status: CallStatus,
    /// Canonical hash of the request.
    pub request_hash: String,
    /// Payload key of the request.
    pub request_ref: Option<String>,
    /// Canonical hash of the response.
    pub response_hash: Option<String>,
    /// Payload key of the response.
    pub response_ref: Option<String>,
    /// Error detail.
    pub error_json: Option<serde_json::Value>,
    /// Latency.
    pub latency_ms: Option<f64>,
    /// Recording time.
    pub created_at: Timestamp,
}

impl Call {
    pub(super) const COLUMNS: &'static str = "call_id, state_id, operation_id, call_index, \
         call_type, status, request_hash, request_ref, response_hash, response_ref, error_json, \
         latency_ms, created_at";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            call_id: row.get(0)?,
            state_id: row.get(1)?,
            operation_id: row.get(2)?,
            call_index: row.get(3)?,
            call_type: row.get(4)?,
            status: row.get(5)?,
            request_hash: row.get(6)?,
            request_ref: row.get(7)?,
            response_hash: row.get(8)?,
            response_ref: row.get(9)?,
            error_json: row.get(10)?,
            latency_ms: row.get(11)?,
            created_at: row.get(12)?,
        })
    }
}

/// Parameters for recording an external call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Kind of call.
    pub call_type: CallType,
    /// Result.
    pub status: CallStatus,
    /// Request body.
    pub request: serde_json::Value,
    /// Response body, if any.
    pub response: Option<serde_json::Value>,
    /// Error detail, if any.
    pub error: Option<serde_json::Value>,
    /// Latency.
    pub latency_ms: Option<f64>,
}

impl CallRecord {
    /// A successful call.
    #[must_use]
    pub const fn success(
        call_type: CallType,
        request: serde_json::Value,
        response: serde_json::Value,
    ) -> Self {
        Self {
            call_type,
            status: CallStatus::Success,
            request,
            response: Some(response),
            error: None,
            latency_ms: None,
        }
    }

    /// A failed call.
    #[must_use]
    pub const fn failure(
        call_type: CallType,
        request: serde_json::Value,
        error: serde_json::Value,
    ) -> Self {
        Self {
            call_type,
            status: CallStatus::Error,
            request,
            response: None,
            error: Some(error),
            latency_ms: None,
        }
    }

    /// Sets the latency.
    #[must_use]
    pub const fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// A token crossing an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEvent {
    /// Event identifier.
    pub event_id: String,
    /// Node state that made the decision.
    pub state_id: String,
    /// Edge crossed.
    pub edge_id: String,
    /// Groups events from one decision (fork).
    pub routing_group_id: String,
    /// Position within the group.
    pub ordinal: i64,
    /// Move or copy.
    pub mode: RoutingMode,
    /// Why the route was taken.
    pub reason: Option<serde_json::Value>,
    /// Recording time.
    pub created_at: Timestamp,
}

impl RoutingEvent {
    pub(super) const COLUMNS: &'static str =
        "event_id, state_id, edge_id, routing_group_id, ordinal, mode, reason_json, created_at";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            state_id: row.get(1)?,
            edge_id: row.get(2)?,
            routing_group_id: row.get(3)?,
            ordinal: row.get(4)?,
            mode: row.get(5)?,
            reason: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

/// Terminal (or buffered) classification of a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenOutcome {
    /// Outcome identifier.
    pub outcome_id: String,
    /// Owning run.
    pub run_id: String,
    /// Token classified.
    pub token_id: String,
    /// Classification.
    pub outcome: RowOutcome,
    /// Whether `outcome` is terminal.
    pub is_terminal: bool,
    /// Destination sink, for completed and routed tokens.
    pub sink_name: Option<String>,
    /// Aggregation batch, for buffered and consumed tokens.
    pub batch_id: Option<String>,
    /// Fork group, for forked tokens.
    pub fork_group_id: Option<String>,
    /// Join group, for coalesced tokens.
    pub join_group_id: Option<String>,
    /// Expand group, for expanded tokens.
    pub expand_group_id: Option<String>,
    /// Hash of the error, for failed and quarantined tokens.
    pub error_hash: Option<String>,
    /// Free-form context.
    pub context: Option<serde_json::Value>,
    /// Recording time.
    pub recorded_at: Timestamp,
}

impl TokenOutcome {
    pub(super) const COLUMNS: &'static str = "outcome_id, run_id, token_id, outcome, \
         is_terminal, sink_name, batch_id, fork_group_id, join_group_id, expand_group_id, \
         error_hash, context_json, recorded_at";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            outcome_id: row.get(0)?,
            run_id: row.get(1)?,
            token_id: row.get(2)?,
            outcome: row.get(3)?,
            is_terminal: row.get(4)?,
            sink_name: row.get(5)?,
            batch_id: row.get(6)?,
            fork_group_id: row.get(7)?,
            join_group_id: row.get(8)?,
            expand_group_id: row.get(9)?,
            error_hash: row.get(10)?,
            context: row.get(11)?,
            recorded_at: row.get(12)?,
        })
    }
}

/// Optional fields attached to a token outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutcomeDetails {
    /// Destination sink.
    pub sink_name: Option<String>,
    /// Aggregation batch.
    pub batch_id: Option<String>,
    /// Fork group.
    pub fork_group_id: Option<String>,
    /// Join group.
    pub join_group_id: Option<String>,
    /// Expand group.
    pub expand_group_id: Option<String>,
    /// Error hash.
    pub error_hash: Option<String>,
    /// Free-form context.
    pub context: Option<serde_json::Value>,
}

impl OutcomeDetails {
    /// Details naming a destination sink.
    #[must_use]
    pub fn sink(name: impl Into<String>) -> Self {
        Self {
            sink_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Details naming an aggregation batch.
    #[must_use]
    pub fn batch(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: Some(batch_id.into()),
            ..Self::default()
        }
    }

    /// Sets the error hash.
    #[must_use]
    pub fn with_error_hash(mut self, hash: impl Into<String>) -> Self {
        self.error_hash = Some(hash.into());
        self
    }

    /// Sets the context.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Quarantine record for external data that failed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationErrorRecord {
    /// Record identifier.
    pub error_id: String,
    /// Owning run.
    pub run_id: String,
    /// Source node, when known.
    pub node_id: Option<String>,
    /// Canonical hash of the row, or a repr hash if not encodable.
    pub row_hash: String,
    /// The offending row, or `{"__repr__": ...}`.
    pub row_data: serde_json::Value,
    /// Violation description.
    pub error: String,
    /// Contract mode in force.
    pub schema_mode: String,
    /// Quarantine destination (`discard` when dropped).
    pub destination: String,
    /// Recording time.
    pub created_at: Timestamp,
}

impl ValidationErrorRecord {
    pub(super) const COLUMNS: &'static str = "error_id, run_id, node_id, row_hash, row_data_json, \
         error, schema_mode, destination, created_at";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            error_id: row.get(0)?,
            run_id: row.get(1)?,
            node_id: row.get(2)?,
            row_hash: row.get(3)?,
            row_data: row.get(4)?,
            error: row.get(5)?,
            schema_mode: row.get(6)?,
            destination: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

/// A transform's error for one token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformErrorRecord {
    /// Record identifier.
    pub error_id: String,
    /// Owning run.
    pub run_id: String,
    /// Token that failed.
    pub token_id: String,
    /// Transform node.
    pub node_id: String,
    /// Canonical hash of the input row.
    pub row_hash: String,
    /// The input row.
    pub row_data: serde_json::Value,
    /// Error detail.
    pub error_details: serde_json::Value,
    /// Where the token went (`discard`, a sink name, or `failed`).
    pub destination: String,
    /// Recording time.
    pub created_at: Timestamp,
}

impl TransformErrorRecord {
    pub(super) const COLUMNS: &'static str = "error_id, run_id, token_id, node_id, row_hash, \
         row_data_json, error_details_json, destination, created_at";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            error_id: row.get(0)?,
            run_id: row.get(1)?,
            token_id: row.get(2)?,
            node_id: row.get(3)?,
            row_hash: row.get(4)?,
            row_data: row.get(5)?,
            error_details: row.get(6)?,
            destination: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

/// A resumable snapshot of run progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint identifier.
    pub checkpoint_id: String,
    /// Owning run.
    pub run_id: String,
    /// Last fully processed token.
    pub token_id: String,
    /// Node the token last completed.
    pub node_id: String,
    /// Monotonic sequence within the run.
    pub sequence_number: i64,
    /// Tagged-encoded aggregation buffers, if any.
    pub aggregation_state: Option<serde_json::Value>,
    /// Recording time.
    pub created_at: Timestamp,
}

impl Checkpoint {
    pub(super) const COLUMNS: &'static str = "checkpoint_id, run_id, token_id, node_id, \
         sequence_number, aggregation_state_json, created_at";

    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            checkpoint_id: row.get(0)?,
            run_id: row.get(1)?,
            token_id: row.get(2)?,
            node_id: row.get(3)?,
            sequence_number: row.get(4)?,
            aggregation_state: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}
