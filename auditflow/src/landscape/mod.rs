//! The Landscape: append-only lineage ledger.
//!
//! Every durable effect of a run is a write here: runs, nodes, edges,
//! rows, tokens and their parent edges, per-token node states, boundary
//! operations, external calls, routing events, outcomes, validation and
//! transform errors, and checkpoints. Nothing else writes these tables.
//!
//! Each mutating call is one transaction. Records are never updated in
//! place except for status fields that move once from open to terminal.
//! Inconsistencies in the ledger's own data raise
//! [`LandscapeError::Integrity`] instead of being defaulted.
//!
//! Row payloads and call bodies live in a [`PayloadStore`] keyed by
//! content hash, so they can be purged without breaking the audit trail.

mod checkpoints;
mod enums;
mod errors;
mod lineage;
mod models;
mod payload;
mod quarantine;
mod recorder;
mod reproducibility;
mod schema;
mod states;
mod tokens;

pub use enums::{
    CallStatus, CallType, Determinism, NodeStateStatus, NodeType, OperationStatus,
    OperationType, ReproducibilityGrade, RoutingMode, RowOutcome, RunStatus, UnknownVariant,
};
pub use errors::{LandscapeError, Result};
pub use lineage::{ExplainError, LineageQuery, LineageResult};
pub use models::{
    Call, CallParent, CallRecord, Checkpoint, Edge, ExecutionError, Node, NodeRegistration,
    NodeState, Operation, OutcomeDetails, RoutingEvent, Row, Run, Token, TokenOutcome, TokenParent,
    TransformErrorRecord, ValidationErrorRecord,
};
pub use payload::{FilesystemPayloadStore, InMemoryPayloadStore, PayloadError, PayloadStore};
pub use reproducibility::{compute_grade, PurgeReport};

use crate::canonical::{canonical_json_value, encode_tagged_string, sha256_hex, stable_hash};
use crate::values::RowValue;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

/// Identifies the hashing scheme recorded on every run.
pub const CANONICAL_VERSION: &str = "sha256-canonical-v1";

/// The lineage ledger.
///
/// Open with [`Landscape::open`] for a database file or
/// [`Landscape::open_in_memory`] for tests.
#[derive(Debug)]
pub struct Landscape {
    conn: Mutex<Connection>,
    payloads: Arc<dyn PayloadStore>,
}

impl Landscape {
    /// Opens or creates a ledger database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the
    /// database cannot be opened.
    pub fn open(path: &Path, payloads: Arc<dyn PayloadStore>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, payloads)
    }

    /// Creates an in-memory ledger with an in-memory payload store.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn open_in_memory() -> Result<Self> {
        Self::in_memory_with_payloads(Arc::new(InMemoryPayloadStore::new()))
    }

    /// Creates an in-memory ledger backed by the given payload store.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory_with_payloads(payloads: Arc<dyn PayloadStore>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, payloads)
    }

    fn init(conn: Connection, payloads: Arc<dyn PayloadStore>) -> Result<Self> {
        conn.execute_batch(schema::CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
            payloads,
        })
    }

    /// The payload store.
    #[must_use]
    pub fn payloads(&self) -> &Arc<dyn PayloadStore> {
        &self.payloads
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Runs `f` inside one transaction.
    fn transaction<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Stores a row value as a tagged payload. Returns `(hash, key)`.
    fn store_value(&self, value: &RowValue) -> Result<(String, String)> {
        let hash = stable_hash(value)?;
        let encoded = encode_tagged_string(value)?;
        let key = self.payloads.store(encoded.as_bytes())?;
        Ok((hash, key))
    }

    /// Stores a JSON body canonically. Returns `(hash, key)`.
    fn store_json(&self, value: &serde_json::Value) -> Result<(String, String)> {
        let canonical = canonical_json_value(value)?;
        let hash = sha256_hex(canonical.as_bytes());
        let key = self.payloads.store(canonical.as_bytes())?;
        Ok((hash, key))
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.lock().execute_batch(sql)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::values::RowData;

    /// A ledger with one run, a source, a transform and a sink.
    pub(crate) fn seeded() -> (Landscape, Run) {
        let landscape = Landscape::open_in_memory().unwrap();
        let run = landscape.begin_run(&serde_json::json!({"name": "test"})).unwrap();
        for (id, ty, seq) in [
            ("source::list", NodeType::Source, 0),
            ("step0::map", NodeType::Transform, 1),
            ("sink::out", NodeType::Sink, 2),
        ] {
            landscape
                .register_node(
                    &run.run_id,
                    NodeRegistration::new(id, id, ty, Determinism::Deterministic).with_sequence(seq),
                )
                .unwrap();
        }
        (landscape, run)
    }

    /// Creates a row and its initial token.
    pub(crate) fn row_and_token(landscape: &Landscape, run: &Run, index: i64) -> (Row, Token) {
        let data = RowData::new().with("id", index);
        let row = landscape
            .create_row(&run.run_id, "source::list", index, &data)
            .unwrap();
        let token = landscape.create_token(&row.row_id).unwrap();
        (row, token)
    }
}
