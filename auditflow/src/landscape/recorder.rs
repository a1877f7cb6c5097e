//! Runs, nodes, edges and rows.

use super::{
    compute_grade, Determinism, Edge, Landscape, LandscapeError, Node, NodeRegistration,
    PayloadError, ReproducibilityGrade, Result, RoutingMode, Row, Run, RunStatus,
    CANONICAL_VERSION,
};
use crate::canonical::{canonical_json_value, decode_tagged_str, sha256_hex, stable_hash_json, stable_hash_row};
use crate::utils::{generate_id, now_utc};
use crate::values::{RowData, RowValue};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

pub(super) fn load_run(conn: &Connection, run_id: &str) -> Result<Run> {
    conn.query_row(
        &format!("SELECT {} FROM runs WHERE run_id = ?1", Run::COLUMNS),
        [run_id],
        Run::from_row,
    )
    .optional()?
    .ok_or_else(|| LandscapeError::not_found("run", run_id))
}

pub(super) fn load_row(conn: &Connection, row_id: &str) -> Result<Row> {
    conn.query_row(
        &format!("SELECT {} FROM rows WHERE row_id = ?1", Row::COLUMNS),
        [row_id],
        Row::from_row,
    )
    .optional()?
    .ok_or_else(|| LandscapeError::not_found("row", row_id))
}

impl Landscape {
    /// Starts a run. The settings snapshot is stored with its canonical
    /// hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are not canonically encodable or
    /// the write fails.
    pub fn begin_run(&self, settings: &serde_json::Value) -> Result<Run> {
        let canonical = canonical_json_value(settings)?;
        let run = Run {
            run_id: generate_id(),
            started_at: now_utc(),
            completed_at: None,
            config_hash: sha256_hex(canonical.as_bytes()),
            settings_json: settings.clone(),
            canonical_version: CANONICAL_VERSION.to_string(),
            status: RunStatus::Running,
            reproducibility_grade: None,
        };
        self.lock().execute(
            "INSERT INTO runs (run_id, started_at, completed_at, config_hash, settings_json, \
             canonical_version, status, reproducibility_grade) \
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, NULL)",
            params![
                run.run_id,
                run.started_at,
                run.config_hash,
                run.settings_json,
                run.canonical_version,
                run.status,
            ],
        )?;
        info!(run_id = %run.run_id, config_hash = %run.config_hash, "run started");
        Ok(run)
    }

    /// Loads a run.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] if the run does not exist.
    pub fn get_run(&self, run_id: &str) -> Result<Run> {
        load_run(&self.lock(), run_id)
    }

    /// Ends a running run: sets its final status, completion time and
    /// reproducibility grade.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::InvalidTransition`] if the run is not
    /// running or `status` is `Running`.
    pub fn finalize_run(&self, run_id: &str, status: RunStatus) -> Result<Run> {
        if status == RunStatus::Running {
            return Err(LandscapeError::InvalidTransition {
                entity: "run",
                id: run_id.to_string(),
                reason: "cannot finalize to running".to_string(),
            });
        }
        let run = self.transaction(|tx| {
            let run = load_run(tx, run_id)?;
            if run.status != RunStatus::Running {
                return Err(LandscapeError::InvalidTransition {
                    entity: "run",
                    id: run_id.to_string(),
                    reason: format!("run is already {}", run.status),
                });
            }
            let determinisms = node_determinisms(tx, run_id)?;
            let grade = match run.reproducibility_grade {
                Some(ReproducibilityGrade::AttributableOnly) => ReproducibilityGrade::AttributableOnly,
                _ => compute_grade(determinisms),
            };
            tx.execute(
                "UPDATE runs SET status = ?1, completed_at = ?2, reproducibility_grade = ?3 \
                 WHERE run_id = ?4",
                params![status, now_utc(), grade, run_id],
            )?;
            load_run(tx, run_id)
        })?;
        info!(run_id, status = %run.status, "run finalized");
        Ok(run)
    }

    /// Puts a failed or interrupted run back into `running` for resume.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::InvalidTransition`] if the run is not
    /// resumable.
    pub fn reopen_run(&self, run_id: &str) -> Result<Run> {
        self.transaction(|tx| {
            let run = load_run(tx, run_id)?;
            if !run.status.is_resumable() {
                return Err(LandscapeError::InvalidTransition {
                    entity: "run",
                    id: run_id.to_string(),
                    reason: format!("run is {}, not resumable", run.status),
                });
            }
            tx.execute(
                "UPDATE runs SET status = ?1, completed_at = NULL WHERE run_id = ?2",
                params![RunStatus::Running, run_id],
            )?;
            load_run(tx, run_id)
        })
    }

    /// Registers a node. Nodes are immutable once registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is not canonically encodable
    /// or the node id is already registered in this run.
    pub fn register_node(&self, run_id: &str, registration: NodeRegistration) -> Result<Node> {
        let node = Node {
            node_id: registration.node_id,
            run_id: run_id.to_string(),
            plugin_name: registration.plugin_name,
            plugin_version: registration.plugin_version,
            node_type: registration.node_type,
            determinism: registration.determinism,
            config_hash: stable_hash_json(&registration.config)?,
            config_json: registration.config,
            schema_json: registration.schema,
            sequence: registration.sequence,
            registered_at: now_utc(),
        };
        self.lock().execute(
            "INSERT INTO nodes (node_id, run_id, plugin_name, plugin_version, node_type, \
             determinism, config_hash, config_json, schema_json, sequence, registered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                node.node_id,
                node.run_id,
                node.plugin_name,
                node.plugin_version,
                node.node_type,
                node.determinism,
                node.config_hash,
                node.config_json.to_string(),
                node.schema_json,
                node.sequence,
                node.registered_at,
            ],
        )?;
        debug!(run_id, node_id = %node.node_id, node_type = %node.node_type, "node registered");
        Ok(node)
    }

    /// Loads one node.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] if absent.
    pub fn get_node(&self, run_id: &str, node_id: &str) -> Result<Node> {
        self.lock()
            .query_row(
                &format!("SELECT {} FROM nodes WHERE run_id = ?1 AND node_id = ?2", Node::COLUMNS),
                [run_id, node_id],
                Node::from_row,
            )
            .optional()?
            .ok_or_else(|| LandscapeError::not_found("node", node_id))
    }

    /// All nodes of a run, in pipeline order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_nodes(&self, run_id: &str) -> Result<Vec<Node>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes WHERE run_id = ?1 \
             ORDER BY sequence IS NULL, sequence, node_id",
            Node::COLUMNS
        ))?;
        let nodes = stmt
            .query_map([run_id], Node::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    /// Registers an edge between two nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if either node is unknown or the label is already
    /// used on `from_node_id`.
    pub fn register_edge(
        &self,
        run_id: &str,
        from_node_id: &str,
        to_node_id: &str,
        label: &str,
        mode: RoutingMode,
    ) -> Result<Edge> {
        let edge = Edge {
            edge_id: generate_id(),
            run_id: run_id.to_string(),
            from_node_id: from_node_id.to_string(),
            to_node_id: to_node_id.to_string(),
            label: label.to_string(),
            default_mode: mode,
            created_at: now_utc(),
        };
        self.lock().execute(
            "INSERT INTO edges (edge_id, run_id, from_node_id, to_node_id, label, default_mode, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                edge.edge_id,
                edge.run_id,
                edge.from_node_id,
                edge.to_node_id,
                edge.label,
                edge.default_mode,
                edge.created_at,
            ],
        )?;
        Ok(edge)
    }

    /// Looks up an edge by its origin and label.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_edge(&self, run_id: &str, from_node_id: &str, label: &str) -> Result<Option<Edge>> {
        let edge = self
            .lock()
            .query_row(
                &format!(
                    "SELECT {} FROM edges WHERE run_id = ?1 AND from_node_id = ?2 AND label = ?3",
                    Edge::COLUMNS
                ),
                [run_id, from_node_id, label],
                Edge::from_row,
            )
            .optional()?;
        Ok(edge)
    }

    /// All edges of a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_edges(&self, run_id: &str) -> Result<Vec<Edge>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM edges WHERE run_id = ?1 ORDER BY created_at, edge_id",
            Edge::COLUMNS
        ))?;
        let edges = stmt
            .query_map([run_id], Edge::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Records a source row. The payload is stored tagged so types survive
    /// a later read.
    ///
    /// # Errors
    ///
    /// Returns an error if the row holds non-finite floats, the payload
    /// cannot be stored, or the index is already used in this run.
    pub fn create_row(
        &self,
        run_id: &str,
        source_node_id: &str,
        row_index: i64,
        data: &RowData,
    ) -> Result<Row> {
        let (hash, key) = self.store_value(&RowValue::from(data.clone()))?;
        let row = Row {
            row_id: generate_id(),
            run_id: run_id.to_string(),
            source_node_id: source_node_id.to_string(),
            row_index,
            source_data_hash: hash,
            source_data_ref: Some(key),
            payload_purged: false,
            created_at: now_utc(),
        };
        self.lock().execute(
            "INSERT INTO rows (row_id, run_id, source_node_id, row_index, source_data_hash, \
             source_data_ref, payload_purged, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                row.row_id,
                row.run_id,
                row.source_node_id,
                row.row_index,
                row.source_data_hash,
                row.source_data_ref,
                row.created_at,
            ],
        )?;
        Ok(row)
    }

    /// Loads a row record.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] if absent.
    pub fn get_row(&self, row_id: &str) -> Result<Row> {
        load_row(&self.lock(), row_id)
    }

    /// All rows of a run, by index.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_rows(&self, run_id: &str) -> Result<Vec<Row>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rows WHERE run_id = ?1 ORDER BY row_index",
            Row::COLUMNS
        ))?;
        let rows = stmt
            .query_map([run_id], Row::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Reads a row's original data back from the payload store, with
    /// typed values restored.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::PayloadPurged`] if retention removed the
    /// payload, and [`LandscapeError::Integrity`] if the stored payload
    /// does not decode to the recorded hash.
    pub fn get_row_data(&self, row_id: &str) -> Result<RowData> {
        let row = self.get_row(row_id)?;
        let purged = || LandscapeError::PayloadPurged {
            row_id: row_id.to_string(),
        };
        if row.payload_purged {
            return Err(purged());
        }
        let key = row.source_data_ref.as_deref().ok_or_else(purged)?;
        let bytes = match self.payloads.retrieve(key) {
            Ok(bytes) => bytes,
            Err(PayloadError::NotFound(_)) => return Err(purged()),
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8(bytes)
            .map_err(|e| LandscapeError::integrity(format!("row {row_id} payload is not UTF-8: {e}")))?;
        let data = match decode_tagged_str(&text)? {
            RowValue::Map(fields) => RowData::from(fields),
            other => {
                return Err(LandscapeError::integrity(format!(
                    "row {row_id} payload decoded to {} instead of a map",
                    other.kind()
                )))
            }
        };
        if stable_hash_row(&data)? != row.source_data_hash {
            return Err(LandscapeError::integrity(format!(
                "row {row_id} payload does not match its recorded hash"
            )));
        }
        Ok(data)
    }
}

fn node_determinisms(conn: &Connection, run_id: &str) -> Result<Vec<Determinism>> {
    let mut stmt = conn.prepare("SELECT determinism FROM nodes WHERE run_id = ?1")?;
    let values = stmt
        .query_map([run_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<Determinism>>>()?;
    Ok(values)
}
