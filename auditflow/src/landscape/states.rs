//! Node states, operations, external calls and routing events.

use super::{
    Call, CallParent, CallRecord, ExecutionError, Landscape, LandscapeError, NodeState,
    NodeStateStatus, Operation, OperationStatus, OperationType, Result, RoutingEvent,
    RoutingMode,
};
use crate::utils::{generate_id, now_utc};
use crate::values::{RowData, RowValue};
use rusqlite::{params, Connection, OptionalExtension};

fn load_state(conn: &Connection, state_id: &str) -> Result<NodeState> {
    conn.query_row(
        &format!("SELECT {} FROM node_states WHERE state_id = ?1", NodeState::COLUMNS),
        [state_id],
        NodeState::from_row,
    )
    .optional()?
    .ok_or_else(|| LandscapeError::not_found("node_state", state_id))
}

fn load_operation(conn: &Connection, operation_id: &str) -> Result<Operation> {
    conn.query_row(
        &format!("SELECT {} FROM operations WHERE operation_id = ?1", Operation::COLUMNS),
        [operation_id],
        Operation::from_row,
    )
    .optional()?
    .ok_or_else(|| LandscapeError::not_found("operation", operation_id))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| LandscapeError::integrity(format!("cannot serialize audit field: {e}")))
}

impl Landscape {
    /// Opens a node state for one attempt of a token at a node. The input
    /// row is snapshotted to the payload store.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not canonically encodable or the
    /// token, node or attempt is invalid.
    pub fn begin_node_state(
        &self,
        run_id: &str,
        token_id: &str,
        node_id: &str,
        step_index: i64,
        attempt: i64,
        input: &RowData,
    ) -> Result<NodeState> {
        let (input_hash, input_ref) = self.store_value(&RowValue::from(input.clone()))?;
        let state = NodeState {
            state_id: generate_id(),
            token_id: token_id.to_string(),
            node_id: node_id.to_string(),
            run_id: run_id.to_string(),
            step_index,
            attempt,
            status: NodeStateStatus::Open,
            input_hash,
            input_ref: Some(input_ref),
            output_hash: None,
            output_ref: None,
            error: None,
            started_at: now_utc(),
            completed_at: None,
            duration_ms: None,
        };
        self.lock().execute(
            "INSERT INTO node_states (state_id, token_id, node_id, run_id, step_index, attempt, \
             status, input_hash, input_ref, started_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                state.state_id,
                state.token_id,
                state.node_id,
                state.run_id,
                state.step_index,
                state.attempt,
                state.status,
                state.input_hash,
                state.input_ref,
                state.started_at,
            ],
        )?;
        Ok(state)
    }

    /// Moves an open node state to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::InvalidTransition`] if `status` is `Open`
    /// or the state is no longer open.
    pub fn complete_node_state(
        &self,
        state_id: &str,
        status: NodeStateStatus,
        output: Option<&RowValue>,
        error: Option<&ExecutionError>,
        duration_ms: f64,
    ) -> Result<NodeState> {
        if !status.is_terminal() {
            return Err(LandscapeError::InvalidTransition {
                entity: "node_state",
                id: state_id.to_string(),
                reason: "cannot complete to open".to_string(),
            });
        }
        let (output_hash, output_ref) = match output {
            Some(value) => {
                let (hash, key) = self.store_value(value)?;
                (Some(hash), Some(key))
            }
            None => (None, None),
        };
        let error_json = error.map(to_json).transpose()?;

        self.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE node_states SET status = ?1, output_hash = ?2, output_ref = ?3, \
                 error_json = ?4, completed_at = ?5, duration_ms = ?6 \
                 WHERE state_id = ?7 AND status = ?8",
                params![
                    status,
                    output_hash,
                    output_ref,
                    error_json,
                    now_utc(),
                    duration_ms,
                    state_id,
                    NodeStateStatus::Open,
                ],
            )?;
            if changed == 0 {
                let current = load_state(tx, state_id)?;
                return Err(LandscapeError::InvalidTransition {
                    entity: "node_state",
                    id: state_id.to_string(),
                    reason: format!("state is already {}", current.status),
                });
            }
            load_state(tx, state_id)
        })
    }

    /// Loads a node state.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] if absent.
    pub fn get_node_state(&self, state_id: &str) -> Result<NodeState> {
        load_state(&self.lock(), state_id)
    }

    /// All node states of a token, by step then attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_node_states_for_token(&self, token_id: &str) -> Result<Vec<NodeState>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM node_states WHERE token_id = ?1 ORDER BY step_index, attempt",
            NodeState::COLUMNS
        ))?;
        let states = stmt
            .query_map([token_id], NodeState::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    /// Opens a source-load or sink-write operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown.
    pub fn begin_operation(
        &self,
        run_id: &str,
        node_id: &str,
        operation_type: OperationType,
    ) -> Result<Operation> {
        let op = Operation {
            operation_id: generate_id(),
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            operation_type,
            status: OperationStatus::Open,
            started_at: now_utc(),
            completed_at: None,
            output_metadata: None,
            error_message: None,
            duration_ms: None,
        };
        self.lock().execute(
            "INSERT INTO operations (operation_id, run_id, node_id, operation_type, status, \
             started_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                op.operation_id,
                op.run_id,
                op.node_id,
                op.operation_type,
                op.status,
                op.started_at,
            ],
        )?;
        Ok(op)
    }

    /// Moves an open operation to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::InvalidTransition`] if `status` is `Open`
    /// or the operation is no longer open.
    pub fn complete_operation(
        &self,
        operation_id: &str,
        status: OperationStatus,
        output_metadata: Option<&serde_json::Value>,
        error_message: Option<&str>,
        duration_ms: f64,
    ) -> Result<Operation> {
        if !status.is_terminal() {
            return Err(LandscapeError::InvalidTransition {
                entity: "operation",
                id: operation_id.to_string(),
                reason: "cannot complete to open".to_string(),
            });
        }
        self.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE operations SET status = ?1, output_metadata = ?2, error_message = ?3, \
                 completed_at = ?4, duration_ms = ?5 WHERE operation_id = ?6 AND status = ?7",
                params![
                    status,
                    output_metadata,
                    error_message,
                    now_utc(),
                    duration_ms,
                    operation_id,
                    OperationStatus::Open,
                ],
            )?;
            if changed == 0 {
                let current = load_operation(tx, operation_id)?;
                return Err(LandscapeError::InvalidTransition {
                    entity: "operation",
                    id: operation_id.to_string(),
                    reason: format!("operation is already {}", current.status),
                });
            }
            load_operation(tx, operation_id)
        })
    }

    /// Loads an operation.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] if absent.
    pub fn get_operation(&self, operation_id: &str) -> Result<Operation> {
        load_operation(&self.lock(), operation_id)
    }

    /// All operations of a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_operations(&self, run_id: &str) -> Result<Vec<Operation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM operations WHERE run_id = ?1 ORDER BY started_at, operation_id",
            Operation::COLUMNS
        ))?;
        let ops = stmt
            .query_map([run_id], Operation::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ops)
    }

    /// Records an external call against a node state or operation.
    /// Request and response bodies are hashed canonically and stored as
    /// payloads. The call index is allocated per parent.
    ///
    /// # Errors
    ///
    /// Returns an error if a body is not canonically encodable or the
    /// parent does not exist.
    pub fn record_call(&self, parent: &CallParent, record: &CallRecord) -> Result<Call> {
        let (request_hash, request_ref) = self.store_json(&record.request)?;
        let (response_hash, response_ref) = match &record.response {
            Some(body) => {
                let (hash, key) = self.store_json(body)?;
                (Some(hash), Some(key))
            }
            None => (None, None),
        };
        let (state_id, operation_id) = match parent {
            CallParent::State(id) => (Some(id.clone()), None),
            CallParent::Operation(id) => (None, Some(id.clone())),
        };

        self.transaction(|tx| {
            let call_index: i64 = tx.query_row(
                "SELECT COALESCE(MAX(call_index) + 1, 0) FROM calls \
                 WHERE state_id IS ?1 AND operation_id IS ?2",
                params![state_id, operation_id],
                |row| row.get(0),
            )?;
            let call = Call {
                call_id: generate_id(),
                state_id: state_id.clone(),
                operation_id: operation_id.clone(),
                call_index,
                call_type: record.call_type,
                status: record.status,
                request_hash,
                request_ref: Some(request_ref),
                response_hash,
                response_ref,
                error_json: record.error.clone(),
                latency_ms: record.latency_ms,
                created_at: now_utc(),
            };
            tx.execute(
                "INSERT INTO calls (call_id, state_id, operation_id, call_index, call_type, \
                 status, request_hash, request_ref, response_hash, response_ref, error_json, \
                 latency_ms, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    call.call_id,
                    call.state_id,
                    call.operation_id,
                    call.call_index,
                    call.call_type,
                    call.status,
                    call.request_hash,
                    call.request_ref,
                    call.response_hash,
                    call.response_ref,
                    call.error_json,
                    call.latency_ms,
                    call.created_at,
                ],
            )?;
            Ok(call)
        })
    }

    /// Calls attributed to a node state or operation, by index.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_calls(&self, parent: &CallParent) -> Result<Vec<Call>> {
        let (column, id) = match parent {
            CallParent::State(id) => ("state_id", id),
            CallParent::Operation(id) => ("operation_id", id),
        };
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM calls WHERE {column} = ?1 ORDER BY call_index",
            Call::COLUMNS
        ))?;
        let calls = stmt
            .query_map([id], Call::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(calls)
    }

    /// Records a single routing decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the state or edge does not exist.
    pub fn record_routing_event(
        &self,
        state_id: &str,
        edge_id: &str,
        mode: RoutingMode,
        reason: Option<&serde_json::Value>,
    ) -> Result<RoutingEvent> {
        let routes = [(edge_id.to_string(), mode)];
        let mut events = self.record_routing_events(state_id, &routes, reason)?;
        events
            .pop()
            .ok_or_else(|| LandscapeError::integrity("routing event insert returned nothing"))
    }

    /// Records several routes taken by one decision (a fork) under a
    /// shared routing group.
    ///
    /// # Errors
    ///
    /// Returns an error if the state or any edge does not exist.
    pub fn record_routing_events(
        &self,
        state_id: &str,
        routes: &[(String, RoutingMode)],
        reason: Option<&serde_json::Value>,
    ) -> Result<Vec<RoutingEvent>> {
        let group = generate_id();
        self.transaction(|tx| {
            let mut events = Vec::with_capacity(routes.len());
            for (ordinal, (edge_id, mode)) in routes.iter().enumerate() {
                let event = RoutingEvent {
                    event_id: generate_id(),
                    state_id: state_id.to_string(),
                    edge_id: edge_id.clone(),
                    routing_group_id: group.clone(),
                    ordinal: i64::try_from(ordinal)
                        .map_err(|_| LandscapeError::integrity("routing ordinal overflow"))?,
                    mode: *mode,
                    reason: reason.cloned(),
                    created_at: now_utc(),
                };
                tx.execute(
                    "INSERT INTO routing_events (event_id, state_id, edge_id, routing_group_id, \
                     ordinal, mode, reason_json, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        event.event_id,
                        event.state_id,
                        event.edge_id,
                        event.routing_group_id,
                        event.ordinal,
                        event.mode,
                        event.reason,
                        event.created_at,
                    ],
                )?;
                events.push(event);
            }
            Ok(events)
        })
    }

    /// Routing events made by a node state.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_routing_events(&self, state_id: &str) -> Result<Vec<RoutingEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM routing_events WHERE state_id = ?1 ORDER BY created_at, ordinal",
            RoutingEvent::COLUMNS
        ))?;
        let events = stmt
            .query_map([state_id], RoutingEvent::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landscape::test_support::{row_and_token, seeded};
    use crate::landscape::{CallStatus, CallType};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_node_state_lifecycle() {
        let (landscape, run) = seeded();
        let (_, token) = row_and_token(&landscape, &run, 0);
        let input = RowData::new().with("id", 0_i64);
        let state = landscape
            .begin_node_state(&run.run_id, &token.token_id, "step0::map", 1, 1, &input)
            .unwrap();
        assert_eq!(state.status, NodeStateStatus::Open);

        let output = RowValue::from(RowData::new().with("id", 0_i64).with("x", true));
        let done = landscape
            .complete_node_state(&state.state_id, NodeStateStatus::Completed, Some(&output), None, 1.5)
            .unwrap();
        assert_eq!(done.status, NodeStateStatus::Completed);
        assert!(done.output_hash.is_some());
        assert_eq!(done.duration_ms, Some(1.5));

        let again = landscape.complete_node_state(
            &state.state_id,
            NodeStateStatus::Failed,
            None,
            None,
            0.0,
        );
        assert!(matches!(again, Err(LandscapeError::InvalidTransition { .. })));
    }

    #[test]
    fn test_failed_state_keeps_error_detail() {
        let (landscape, run) = seeded();
        let (_, token) = row_and_token(&landscape, &run, 0);
        let state = landscape
            .begin_node_state(&run.run_id, &token.token_id, "step0::map", 1, 1, &RowData::new())
            .unwrap();
        let error = ExecutionError::new("PluginError", "boom").with_phase("process");
        landscape
            .complete_node_state(&state.state_id, NodeStateStatus::Failed, None, Some(&error), 0.1)
            .unwrap();

        let states = landscape.get_node_states_for_token(&token.token_id).unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].error, Some(error));
    }

    #[test]
    fn test_cannot_complete_to_open() {
        let (landscape, run) = seeded();
        let (_, token) = row_and_token(&landscape, &run, 0);
        let state = landscape
            .begin_node_state(&run.run_id, &token.token_id, "step0::map", 1, 1, &RowData::new())
            .unwrap();
        assert!(landscape
            .complete_node_state(&state.state_id, NodeStateStatus::Open, None, None, 0.0)
            .is_err());
    }

    #[test]
    fn test_operation_pending_is_terminal() {
        let (landscape, run) = seeded();
        let op = landscape
            .begin_operation(&run.run_id, "sink::out", OperationType::SinkWrite)
            .unwrap();
        let meta = serde_json::json!({"batch": "abc"});
        let done = landscape
            .complete_operation(&op.operation_id, OperationStatus::Pending, Some(&meta), None, 2.0)
            .unwrap();
        assert_eq!(done.status, OperationStatus::Pending);
        assert_eq!(done.output_metadata, Some(meta));
        assert!(landscape
            .complete_operation(&op.operation_id, OperationStatus::Completed, None, None, 0.0)
            .is_err());
    }

    #[test]
    fn test_call_indexes_per_parent() {
        let (landscape, run) = seeded();
        let op = landscape
            .begin_operation(&run.run_id, "source::list", OperationType::SourceLoad)
            .unwrap();
        let parent = CallParent::Operation(op.operation_id.clone());
        let first = landscape
            .record_call(
                &parent,
                &CallRecord::success(CallType::Http, serde_json::json!({"url": "a"}), serde_json::json!(1)),
            )
            .unwrap();
        let second = landscape
            .record_call(
                &parent,
                &CallRecord::failure(CallType::Http, serde_json::json!({"url": "b"}), serde_json::json!("timeout"))
                    .with_latency_ms(30.0),
            )
            .unwrap();

        assert_eq!(first.call_index, 0);
        assert_eq!(second.call_index, 1);
        assert_eq!(second.status, CallStatus::Error);
        let calls = landscape.get_calls(&parent).unwrap();
        assert_eq!(calls.len(), 2);
        assert!(landscape.payloads().exists(calls[0].request_ref.as_deref().unwrap()));
    }

    #[test]
    fn test_routing_events_share_group() {
        let (landscape, run) = seeded();
        let (_, token) = row_and_token(&landscape, &run, 0);
        let state = landscape
            .begin_node_state(&run.run_id, &token.token_id, "step0::map", 1, 1, &RowData::new())
            .unwrap();
        let a = landscape
            .register_edge(&run.run_id, "step0::map", "sink::out", "a", RoutingMode::Copy)
            .unwrap();
        let b = landscape
            .register_edge(&run.run_id, "step0::map", "sink::out", "b", RoutingMode::Copy)
            .unwrap();
        let routes = vec![(a.edge_id, RoutingMode::Copy), (b.edge_id, RoutingMode::Copy)];
        let events = landscape
            .record_routing_events(&state.state_id, &routes, Some(&serde_json::json!({"rule": "fork"})))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].routing_group_id, events[1].routing_group_id);
        assert_eq!(landscape.get_routing_events(&state.state_id).unwrap().len(), 2);
    }
}
