//! Context passed into every plugin call.

use crate::contracts::ContractMode;
use crate::landscape::{
    Call, CallParent, CallRecord, CallStatus, CallType, Landscape, LandscapeError,
    ValidationErrorRecord,
};
use crate::values::RowValue;
use serde_json::Value;
use std::sync::Arc;

/// What a plugin call is running under.
///
/// External calls recorded through the context are attributed to the
/// active node state or operation. Lifecycle hooks run without one.
#[derive(Debug, Clone)]
pub struct PluginContext {
    landscape: Arc<Landscape>,
    run_id: String,
    node_id: String,
    parent: Option<CallParent>,
}

impl PluginContext {
    /// A context with no active state or operation.
    #[must_use]
    pub fn new(landscape: Arc<Landscape>, run_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            landscape,
            run_id: run_id.into(),
            node_id: node_id.into(),
            parent: None,
        }
    }

    /// Attributes calls to a node state.
    #[must_use]
    pub fn with_state(mut self, state_id: impl Into<String>) -> Self {
        self.parent = Some(CallParent::State(state_id.into()));
        self
    }

    /// Attributes calls to an operation.
    #[must_use]
    pub fn with_operation(mut self, operation_id: impl Into<String>) -> Self {
        self.parent = Some(CallParent::Operation(operation_id.into()));
        self
    }

    /// Current run.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Node the plugin is registered as.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Active node state, if any.
    #[must_use]
    pub fn state_id(&self) -> Option<&str> {
        match &self.parent {
            Some(CallParent::State(id)) => Some(id),
            _ => None,
        }
    }

    /// Active operation, if any.
    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        match &self.parent {
            Some(CallParent::Operation(id)) => Some(id),
            _ => None,
        }
    }

    /// Records an external call made by the plugin. For failed calls the
    /// response is recorded as the error detail.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::InvalidTransition`] when no state or
    /// operation is active, or any ledger error from the write.
    pub fn record_call(
        &self,
        call_type: CallType,
        request: Value,
        response: Option<Value>,
        status: CallStatus,
        latency_ms: f64,
    ) -> Result<Call, LandscapeError> {
        let parent = self.parent.as_ref().ok_or_else(|| LandscapeError::InvalidTransition {
            entity: "call",
            id: self.node_id.clone(),
            reason: "no active node state or operation".to_string(),
        })?;
        let body = response.unwrap_or(Value::Null);
        let record = match status {
            CallStatus::Success => CallRecord::success(call_type, request, body),
            CallStatus::Error => CallRecord::failure(call_type, request, body),
        };
        self.landscape
            .record_call(parent, &record.with_latency_ms(latency_ms))
    }

    /// Records external input that failed validation.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the write fails.
    pub fn record_validation_error(
        &self,
        row: &RowValue,
        error: &str,
        schema_mode: ContractMode,
        destination: &str,
    ) -> Result<ValidationErrorRecord, LandscapeError> {
        self.landscape.record_validation_error(
            &self.run_id,
            Some(&self.node_id),
            row,
            error,
            schema_mode,
            destination,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landscape::test_support::{row_and_token, seeded};
    use crate::values::RowData;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_record_call_attributed_to_state() {
        let (landscape, run) = seeded();
        let landscape = Arc::new(landscape);
        let (_, token) = row_and_token(&landscape, &run, 0);
        let state = landscape
            .begin_node_state(&run.run_id, &token.token_id, "step0::map", 1, 1, &RowData::new())
            .unwrap();

        let ctx = PluginContext::new(Arc::clone(&landscape), &run.run_id, "step0::map")
            .with_state(&state.state_id);
        assert_eq!(ctx.state_id(), Some(state.state_id.as_str()));

        ctx.record_call(
            CallType::Http,
            json!({"url": "https://example.test"}),
            Some(json!({"status": 200})),
            CallStatus::Success,
            12.5,
        )
        .unwrap();
        ctx.record_call(CallType::Http, json!({"retry": true}), None, CallStatus::Error, 3.0)
            .unwrap();

        let calls = landscape
            .get_calls(&CallParent::State(state.state_id.clone()))
            .unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_index, 0);
        assert_eq!(calls[1].status, CallStatus::Error);
    }

    #[test]
    fn test_record_call_without_parent_fails() {
        let (landscape, run) = seeded();
        let ctx = PluginContext::new(Arc::new(landscape), &run.run_id, "step0::map");
        let err = ctx
            .record_call(CallType::Llm, json!({}), None, CallStatus::Success, 0.0)
            .unwrap_err();
        assert!(matches!(err, LandscapeError::InvalidTransition { .. }));
    }

    #[test]
    fn test_record_validation_error() {
        let (landscape, run) = seeded();
        let landscape = Arc::new(landscape);
        let ctx = PluginContext::new(Arc::clone(&landscape), &run.run_id, "source::list");
        let record = ctx
            .record_validation_error(
                &RowValue::from(RowData::new().with("age", "x")),
                "age: coercion_failed",
                ContractMode::Fixed,
                "discard",
            )
            .unwrap();
        assert_eq!(record.node_id.as_deref(), Some("source::list"));
        assert_eq!(landscape.get_validation_errors(&run.run_id).unwrap().len(), 1);
    }
}
