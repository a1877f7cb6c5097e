//! Ledger DDL.

/// Idempotent DDL for the audit tables.
pub(super) const CREATE_TABLES: &str = r"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    config_hash TEXT NOT NULL,
    settings_json TEXT NOT NULL,
    canonical_version TEXT NOT NULL,
    status TEXT NOT NULL,
    reproducibility_grade TEXT
);

CREATE TABLE IF NOT EXISTS nodes (
    node_id TEXT NOT NULL,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    plugin_name TEXT NOT NULL,
    plugin_version TEXT NOT NULL,
    node_type TEXT NOT NULL,
    determinism TEXT NOT NULL,
    config_hash TEXT NOT NULL,
    config_json TEXT NOT NULL,
    schema_json TEXT,
    sequence INTEGER,
    registered_at TEXT NOT NULL,
    PRIMARY KEY (run_id, node_id)
);

CREATE TABLE IF NOT EXISTS edges (
    edge_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    from_node_id TEXT NOT NULL,
    to_node_id TEXT NOT NULL,
    label TEXT NOT NULL,
    default_mode TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (run_id, from_node_id, label),
    FOREIGN KEY (run_id, from_node_id) REFERENCES nodes(run_id, node_id),
    FOREIGN KEY (run_id, to_node_id) REFERENCES nodes(run_id, node_id)
);

CREATE TABLE IF NOT EXISTS rows (
    row_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    source_node_id TEXT NOT NULL,
    row_index INTEGER NOT NULL,
    source_data_hash TEXT NOT NULL,
    source_data_ref TEXT,
    payload_purged INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (run_id, row_index),
    FOREIGN KEY (run_id, source_node_id) REFERENCES nodes(run_id, node_id)
);

CREATE TABLE IF NOT EXISTS tokens (
    token_id TEXT PRIMARY KEY,
    row_id TEXT NOT NULL REFERENCES rows(row_id),
    fork_group_id TEXT,
    join_group_id TEXT,
    expand_group_id TEXT,
    branch_name TEXT,
    step_in_pipeline INTEGER,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS token_parents (
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    parent_token_id TEXT NOT NULL REFERENCES tokens(token_id),
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (token_id, parent_token_id),
    UNIQUE (token_id, ordinal)
);

CREATE TABLE IF NOT EXISTS token_outcomes (
    outcome_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    outcome TEXT NOT NULL,
    is_terminal INTEGER NOT NULL,
    sink_name TEXT,
    batch_id TEXT,
    fork_group_id TEXT,
    join_group_id TEXT,
    expand_group_id TEXT,
    error_hash TEXT,
    context_json TEXT,
    recorded_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_token_outcomes_terminal
    ON token_outcomes (token_id) WHERE is_terminal = 1;

CREATE TABLE IF NOT EXISTS node_states (
    state_id TEXT PRIMARY KEY,
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    node_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    input_hash TEXT NOT NULL,
    input_ref TEXT,
    output_hash TEXT,
    output_ref TEXT,
    error_json TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    duration_ms REAL,
    UNIQUE (token_id, node_id, attempt),
    FOREIGN KEY (run_id, node_id) REFERENCES nodes(run_id, node_id)
);

CREATE TABLE IF NOT EXISTS operations (
    operation_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    output_metadata TEXT,
    error_message TEXT,
    duration_ms REAL,
    FOREIGN KEY (run_id, node_id) REFERENCES nodes(run_id, node_id)
);

CREATE TABLE IF NOT EXISTS calls (
    call_id TEXT PRIMARY KEY,
    state_id TEXT REFERENCES node_states(state_id),
    operation_id TEXT REFERENCES operations(operation_id),
    call_index INTEGER NOT NULL,
    call_type TEXT NOT NULL,
    status TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    request_ref TEXT,
    response_hash TEXT,
    response_ref TEXT,
    error_json TEXT,
    latency_ms REAL,
    created_at TEXT NOT NULL,
    CHECK ((state_id IS NULL) != (operation_id IS NULL))
);

CREATE TABLE IF NOT EXISTS routing_events (
    event_id TEXT PRIMARY KEY,
    state_id TEXT NOT NULL REFERENCES node_states(state_id),
    edge_id TEXT NOT NULL REFERENCES edges(edge_id),
    routing_group_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    mode TEXT NOT NULL,
    reason_json TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS validation_errors (
    error_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    node_id TEXT,
    row_hash TEXT NOT NULL,
    row_data_json TEXT NOT NULL,
    error TEXT NOT NULL,
    schema_mode TEXT NOT NULL,
    destination TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transform_errors (
    error_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    node_id TEXT NOT NULL,
    row_hash TEXT NOT NULL,
    row_data_json TEXT NOT NULL,
    error_details_json TEXT NOT NULL,
    destination TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    node_id TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    aggregation_state_json TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (run_id, sequence_number)
);

CREATE INDEX IF NOT EXISTS idx_rows_run ON rows (run_id, row_index);
CREATE INDEX IF NOT EXISTS idx_tokens_row ON tokens (row_id);
CREATE INDEX IF NOT EXISTS idx_node_states_token ON node_states (token_id, step_index);
CREATE INDEX IF NOT EXISTS idx_token_outcomes_token ON token_outcomes (token_id);
CREATE INDEX IF NOT EXISTS idx_validation_errors_row ON validation_errors (run_id, row_hash);
";
