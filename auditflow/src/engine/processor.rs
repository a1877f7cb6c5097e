//! Per-token traversal of the pipeline.
//!
//! A [`TokenProcessor`] drives every token of one source row through the
//! steps in order. Forks, expansions and aggregation outputs enqueue new
//! tokens on a work queue local to the row, so a token is never at two
//! nodes at once. Every plugin call runs inside a node-state guard, and
//! every leaf token ends in exactly one terminal outcome.

use super::pipeline::{MergePolicy, Pipeline, Step, CONTINUE_LABEL, DISCARD};
use super::summary::TokenDisposition;
use super::token::TokenInfo;
use crate::canonical::{decode_tagged_row, encode_tagged_row, stable_hash_json};
use crate::contracts::SchemaContract;
use crate::errors::{AuditflowError, PluginError};
use crate::events::{names, EventSink};
use crate::guards::{run_in_node_state, track_operation, OperationOutcome, StateTarget};
use crate::landscape::{
    Landscape, LandscapeError, NodeStateStatus, OperationType, OutcomeDetails, RoutingMode,
    RowOutcome,
};
use crate::plugins::{
    BatchTransform, Gate, GateDecision, PluginContext, SinkWrite, Transform, TransformResult,
};
use crate::retry::{MaxRetriesExceeded, RetryError, RetryManager};
use crate::utils::generate_id;
use crate::values::{RowData, RowValue};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything that happened while processing one row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowReport {
    /// Source position, when the report is for a source row.
    pub row_index: Option<i64>,
    /// Most recent token to reach a node.
    pub last_token_id: Option<String>,
    /// Node that token last reached.
    pub last_node_id: Option<String>,
    /// Leaf dispositions, in the order they were reached.
    pub dispositions: Vec<TokenDisposition>,
    /// Whether any token entered an aggregation.
    pub touched_aggregation: bool,
}

impl RowReport {
    fn for_row(token: &TokenInfo, node_id: &str) -> Self {
        Self {
            row_index: Some(token.row_index),
            last_token_id: Some(token.token_id.clone()),
            last_node_id: Some(node_id.to_string()),
            ..Self::default()
        }
    }

    fn touch(&mut self, token_id: &str, node_id: &str) {
        self.last_token_id = Some(token_id.to_string());
        self.last_node_id = Some(node_id.to_string());
    }

    fn record(&mut self, disposition: TokenDisposition) {
        self.dispositions.push(disposition);
    }

    /// Merges another report's dispositions into this one.
    pub fn absorb(&mut self, other: Self) {
        self.dispositions.extend(other.dispositions);
        self.touched_aggregation |= other.touched_aggregation;
        if other.last_token_id.is_some() {
            self.last_token_id = other.last_token_id;
            self.last_node_id = other.last_node_id;
        }
    }
}

#[derive(Debug)]
struct WorkItem {
    token: TokenInfo,
    step: usize,
}

enum StepFlow {
    Next(TokenInfo),
    Spawn(Vec<TokenInfo>),
    Stop,
}

enum AttemptOutput {
    Rows(Vec<RowData>, bool),
    Pending,
}

#[derive(Debug)]
struct BatchBuffer {
    batch_id: String,
    tokens: Vec<TokenInfo>,
}

impl BatchBuffer {
    fn new() -> Self {
        Self {
            batch_id: generate_id(),
            tokens: Vec::new(),
        }
    }
}

type JoinKey = (usize, String);

/// Moves tokens through a pipeline's steps and records every effect.
#[derive(Debug)]
pub struct TokenProcessor {
    landscape: Arc<Landscape>,
    pipeline: Arc<Pipeline>,
    run_id: String,
    retry: RetryManager,
    events: Arc<dyn EventSink>,
    buffers: Mutex<BTreeMap<usize, BatchBuffer>>,
}

impl TokenProcessor {
    /// Creates a processor for one run.
    #[must_use]
    pub fn new(
        landscape: Arc<Landscape>,
        pipeline: Arc<Pipeline>,
        run_id: impl Into<String>,
        retry: RetryManager,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            landscape,
            pipeline,
            run_id: run_id.into(),
            retry,
            events,
            buffers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Processes a source token and everything derived from it.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures that must stop the run: ledger
    /// errors, contract violations between plugins, and sink failures.
    /// Plugin failures inside transforms and gates end the token instead.
    pub async fn process_row(&self, token: TokenInfo) -> Result<RowReport, AuditflowError> {
        let mut report = RowReport::for_row(&token, &self.pipeline.source_node_id());
        self.run_queue(vec![WorkItem { token, step: 0 }], &mut report)
            .await?;
        Ok(report)
    }

    async fn run_queue(
        &self,
        items: Vec<WorkItem>,
        report: &mut RowReport,
    ) -> Result<(), AuditflowError> {
        let mut queue: VecDeque<WorkItem> = items.into();
        let mut joins: BTreeMap<JoinKey, HashMap<String, TokenInfo>> = BTreeMap::new();
        while let Some(item) = queue.pop_front() {
            self.advance(item, &mut queue, &mut joins, report).await?;
        }

        for ((step, _), arrived) in joins {
            let node_id = self.pipeline.step_node_id(step);
            for token in arrived.into_values() {
                let context = json!({
                    "node_id": node_id,
                    "reason": "coalesce incomplete",
                    "branch": token.branch,
                });
                let details = OutcomeDetails::default()
                    .with_error_hash(stable_hash_json(&context)?)
                    .with_context(context);
                self.landscape
                    .record_token_outcome(&self.run_id, &token.token_id, RowOutcome::Failed, &details)?;
                warn!(token_id = %token.token_id, node_id = %node_id, "coalesce never completed");
                report.record(TokenDisposition::Failed);
            }
        }
        Ok(())
    }

    async fn advance(
        &self,
        item: WorkItem,
        queue: &mut VecDeque<WorkItem>,
        joins: &mut BTreeMap<JoinKey, HashMap<String, TokenInfo>>,
        report: &mut RowReport,
    ) -> Result<(), AuditflowError> {
        let WorkItem { mut token, mut step } = item;
        loop {
            let Some(current) = self.pipeline.steps().get(step) else {
                let sink = self.pipeline.default_sink().to_string();
                return self
                    .deliver(&token, &sink, RowOutcome::Completed, OutcomeDetails::default(), report)
                    .await;
            };

            let flow = match current {
                Step::Transform {
                    plugin,
                    on_error,
                    branch,
                } => {
                    if !token.is_on(branch.as_deref()) {
                        step += 1;
                        continue;
                    }
                    self.transform(token, step, plugin, on_error.as_deref(), report)
                        .await?
                }
                Step::Gate {
                    plugin,
                    routes,
                    branches,
                    branch,
                } => {
                    if !token.is_on(branch.as_deref()) {
                        step += 1;
                        continue;
                    }
                    self.gate(token, step, plugin, routes, branches, report)
                        .await?
                }
                Step::Aggregation { trigger_count, .. } => {
                    self.buffer(token, step, *trigger_count, report).await?
                }
                Step::Coalesce {
                    branches, policy, ..
                } => {
                    self.coalesce(token, step, branches, *policy, joins, report)
                        .await?
                }
            };

            match flow {
                StepFlow::Next(next) => {
                    token = next;
                    step += 1;
                }
                StepFlow::Spawn(children) => {
                    queue.extend(children.into_iter().map(|child| WorkItem {
                        token: child,
                        step: step + 1,
                    }));
                    return Ok(());
                }
                StepFlow::Stop => return Ok(()),
            }
        }
    }

    fn context(&self, node_id: &str) -> PluginContext {
        PluginContext::new(Arc::clone(&self.landscape), self.run_id.clone(), node_id)
    }

    fn target<'a>(&'a self, token: &'a TokenInfo, node_id: &'a str, step: i64, attempt: u32) -> StateTarget<'a> {
        StateTarget {
            run_id: &self.run_id,
            token_id: &token.token_id,
            node_id,
            step_index: step,
            attempt: i64::from(attempt),
        }
    }

    async fn transform(
        &self,
        token: TokenInfo,
        step: usize,
        plugin: &Arc<dyn Transform>,
        on_error: Option<&str>,
        report: &mut RowReport,
    ) -> Result<StepFlow, AuditflowError> {
        let node_id = self.pipeline.step_node_id(step);
        let sequence = self.pipeline.step_sequence(step);
        token.contract.verify_pipeline_row(&node_id, &token.data)?;

        let this = self;
        let (node, current) = (node_id.as_str(), &token);
        let result = self
            .retry
            .execute(
                move |attempt| this.transform_attempt(current, node, sequence, attempt, plugin),
                is_retryable_plugin_error,
                |attempt, error| this.note_retry(current, node, attempt, error),
            )
            .await;
        report.touch(&token.token_id, &node_id);

        match result {
            Ok(AttemptOutput::Rows(mut rows, false)) if rows.len() == 1 => {
                let row = rows.pop().unwrap_or_default();
                Ok(StepFlow::Next(token.with_data(row)))
            }
            Ok(AttemptOutput::Rows(rows, _)) if rows.is_empty() => {
                let details = OutcomeDetails::default()
                    .with_context(json!({ "node_id": node_id, "reason": "no output rows" }));
                self.landscape.record_token_outcome(
                    &self.run_id,
                    &token.token_id,
                    RowOutcome::Completed,
                    &details,
                )?;
                debug!(token_id = %token.token_id, node_id = %node_id, "token filtered");
                report.record(TokenDisposition::Filtered);
                Ok(StepFlow::Stop)
            }
            Ok(AttemptOutput::Rows(rows, _)) => {
                let (children, group) = self.landscape.expand_token(
                    &self.run_id,
                    &token.token_id,
                    &token.row_id,
                    rows.len(),
                    sequence,
                )?;
                debug!(token_id = %token.token_id, expand_group_id = %group, count = rows.len(), "token expanded");
                Ok(StepFlow::Spawn(
                    children
                        .into_iter()
                        .zip(rows)
                        .map(|(child, row)| token.child(child.token_id, row))
                        .collect(),
                ))
            }
            Ok(AttemptOutput::Pending) => {
                report.record(TokenDisposition::Pending);
                Ok(StepFlow::Stop)
            }
            Err(err) => {
                self.fail_token(&token, &node_id, on_error, err, report)
                    .await?;
                Ok(StepFlow::Stop)
            }
        }
    }

    async fn transform_attempt(
        &self,
        token: &TokenInfo,
        node_id: &str,
        sequence: i64,
        attempt: u32,
        plugin: &Arc<dyn Transform>,
    ) -> Result<AttemptOutput, AuditflowError> {
        let target = self.target(token, node_id, sequence, attempt);
        run_in_node_state::<_, AuditflowError, _, _>(&self.landscape, target, &token.data, |state| async move {
            let ctx = self.context(node_id).with_state(state.state_id());
            match plugin.process(&token.data, &ctx).await {
                TransformResult::Success(row) => {
                    state.succeed(&RowValue::from(row.clone()))?;
                    Ok(AttemptOutput::Rows(vec![row], false))
                }
                TransformResult::Multi(rows) => {
                    let output = RowValue::Array(rows.iter().cloned().map(RowValue::from).collect());
                    state.succeed(&output)?;
                    Ok(AttemptOutput::Rows(rows, true))
                }
                TransformResult::Pending => {
                    state.complete(NodeStateStatus::Pending, None, None)?;
                    Ok(AttemptOutput::Pending)
                }
                TransformResult::Error { reason, retryable } => {
                    Err(plugin_failure(plugin.name(), reason, retryable).into())
                }
            }
        })
        .await
    }

    fn note_retry(&self, token: &TokenInfo, node_id: &str, attempt: u32, error: &AuditflowError) {
        warn!(
            run_id = %self.run_id,
            token_id = %token.token_id,
            node_id,
            attempt,
            error = %error,
            "retrying transform"
        );
        self.events.try_emit(
            names::TOKEN_RETRYING,
            Some(json!({
                "run_id": self.run_id,
                "token_id": token.token_id,
                "node_id": node_id,
                "attempt": attempt,
                "error": error.to_string(),
            })),
        );
    }

    /// Ends a token after a plugin failure, or returns the error if it is
    /// not a plugin failure.
    async fn fail_token(
        &self,
        token: &TokenInfo,
        node_id: &str,
        on_error: Option<&str>,
        error: RetryError<AuditflowError>,
        report: &mut RowReport,
    ) -> Result<(), AuditflowError> {
        let (plugin_error, attempts) = match error {
            RetryError::Fatal(AuditflowError::Plugin(e)) => (e, None),
            RetryError::Exhausted(MaxRetriesExceeded {
                attempts,
                last_error: AuditflowError::Plugin(e),
            }) => (e, Some(attempts)),
            other => return Err(other.into_last_error()),
        };
        self.handle_failure(token, node_id, on_error, &plugin_error, attempts, report)
            .await
    }

    async fn handle_failure(
        &self,
        token: &TokenInfo,
        node_id: &str,
        on_error: Option<&str>,
        error: &PluginError,
        attempts: Option<u32>,
        report: &mut RowReport,
    ) -> Result<(), AuditflowError> {
        let mut reason = error
            .detail
            .clone()
            .unwrap_or_else(|| json!({ "message": error.message }));
        if let (Some(attempts), Value::Object(map)) = (attempts, &mut reason) {
            map.insert("attempts".to_string(), json!(attempts));
        }
        let error_hash = stable_hash_json(&reason)?;

        match on_error {
            Some(destination) => {
                self.landscape.record_transform_error(
                    &self.run_id,
                    &token.token_id,
                    node_id,
                    &token.data,
                    &reason,
                    destination,
                )?;
                debug!(token_id = %token.token_id, node_id, destination, "token quarantined");
                let details = OutcomeDetails::default().with_error_hash(error_hash);
                if destination == DISCARD {
                    self.landscape.record_token_outcome(
                        &self.run_id,
                        &token.token_id,
                        RowOutcome::Quarantined,
                        &details.with_context(json!({ "node_id": node_id, "destination": DISCARD })),
                    )?;
                    report.record(TokenDisposition::Quarantined {
                        destination: DISCARD.to_string(),
                    });
                    Ok(())
                } else {
                    self.deliver(token, destination, RowOutcome::Quarantined, details, report)
                        .await
                }
            }
            None => {
                let details = OutcomeDetails::default()
                    .with_error_hash(error_hash)
                    .with_context(json!({ "node_id": node_id, "error": reason }));
                self.landscape.record_token_outcome(
                    &self.run_id,
                    &token.token_id,
                    RowOutcome::Failed,
                    &details,
                )?;
                warn!(token_id = %token.token_id, node_id, error = %error, "token failed");
                report.record(TokenDisposition::Failed);
                Ok(())
            }
        }
    }

    /// Writes a token to a sink and records its terminal outcome.
    ///
    /// A sink failure is returned: the run cannot continue without its
    /// output.
    async fn deliver(
        &self,
        token: &TokenInfo,
        sink_name: &str,
        outcome: RowOutcome,
        details: OutcomeDetails,
        report: &mut RowReport,
    ) -> Result<(), AuditflowError> {
        let sink = self
            .pipeline
            .sink(sink_name)
            .ok_or_else(|| AuditflowError::pipeline(format!("unknown sink '{sink_name}'")))?;
        let node_id = self.pipeline.sink_node_id(sink_name);
        token.contract.verify_pipeline_row(&node_id, &token.data)?;

        let node = node_id.as_str();
        let target = self.target(token, node, self.pipeline.sink_sequence(sink_name), 1);
        let written = run_in_node_state::<_, AuditflowError, _, _>(&self.landscape, target, &token.data, |state| async move {
            state.set_phase("write");
            let write = track_operation::<_, AuditflowError, _, _>(
                &self.landscape,
                &self.run_id,
                node,
                OperationType::SinkWrite,
                |op| async move {
                    let ctx = self.context(node).with_operation(op.operation_id());
                    match sink.write(std::slice::from_ref(&token.data), &ctx).await? {
                        SinkWrite::Completed(metadata) => {
                            op.set_metadata(metadata);
                            Ok(OperationOutcome::Completed(()))
                        }
                        SinkWrite::Pending => Ok(OperationOutcome::Pending(())),
                    }
                },
            )
            .await?;
            if write.is_pending() {
                state.complete(NodeStateStatus::Pending, None, None)?;
                Ok(false)
            } else {
                state.succeed(&RowValue::from(token.data.clone()))?;
                Ok(true)
            }
        })
        .await?;
        report.touch(&token.token_id, node);

        if !written {
            report.record(TokenDisposition::Pending);
            return Ok(());
        }
        let details = OutcomeDetails {
            sink_name: Some(sink_name.to_string()),
            ..details
        };
        self.landscape
            .record_token_outcome(&self.run_id, &token.token_id, outcome, &details)?;
        self.events.try_emit(
            names::TOKEN_COMPLETED,
            Some(json!({
                "run_id": self.run_id,
                "token_id": token.token_id,
                "row_id": token.row_id,
                "sink": sink_name,
                "outcome": outcome.to_string(),
            })),
        );
        report.record(match outcome {
            RowOutcome::Routed => TokenDisposition::Routed {
                sink: sink_name.to_string(),
            },
            RowOutcome::Quarantined => TokenDisposition::Quarantined {
                destination: sink_name.to_string(),
            },
            _ => TokenDisposition::Completed {
                sink: sink_name.to_string(),
            },
        });
        Ok(())
    }

    async fn gate(
        &self,
        token: TokenInfo,
        step: usize,
        plugin: &Arc<dyn Gate>,
        routes: &BTreeMap<String, String>,
        branches: &[String],
        report: &mut RowReport,
    ) -> Result<StepFlow, AuditflowError> {
        let node_id = self.pipeline.step_node_id(step);
        let sequence = self.pipeline.step_sequence(step);
        token.contract.verify_pipeline_row(&node_id, &token.data)?;

        let node = node_id.as_str();
        let current = &token;
        let target = self.target(current, node, sequence, 1);
        let evaluated = run_in_node_state::<_, AuditflowError, _, _>(&self.landscape, target, &token.data, |state| async move {
            let ctx = self.context(node).with_state(state.state_id());
            let decision = plugin.evaluate(&current.data, &ctx).await?;
            state.succeed(&RowValue::from(current.data.clone()))?;
            Ok((state.state_id().to_string(), decision))
        })
        .await;
        report.touch(&token.token_id, node);

        let (state_id, decision) = match evaluated {
            Ok(value) => value,
            Err(AuditflowError::Plugin(error)) => {
                self.handle_failure(&token, node, None, &error, None, report)
                    .await?;
                return Ok(StepFlow::Stop);
            }
            Err(other) => return Err(other),
        };

        match decision {
            GateDecision::Continue => {
                let edge = self.edge(node, CONTINUE_LABEL)?;
                self.landscape
                    .record_routing_event(&state_id, &edge, RoutingMode::Move, None)?;
                Ok(StepFlow::Next(token))
            }
            GateDecision::Route(label) => {
                let Some(sink) = routes.get(&label) else {
                    let error = PluginError::new(plugin.name(), format!("unknown route label '{label}'"));
                    self.handle_failure(&token, node, None, &error, None, report)
                        .await?;
                    return Ok(StepFlow::Stop);
                };
                let edge = self.edge(node, &label)?;
                let reason = json!({ "route": label });
                self.landscape
                    .record_routing_event(&state_id, &edge, RoutingMode::Move, Some(&reason))?;
                self.deliver(&token, sink, RowOutcome::Routed, OutcomeDetails::default(), report)
                    .await?;
                Ok(StepFlow::Stop)
            }
            GateDecision::Fork(targets) => {
                if targets.is_empty() || targets.iter().any(|t| !branches.contains(t)) {
                    let error = PluginError::new(
                        plugin.name(),
                        format!("fork targets {targets:?} are not declared branches"),
                    );
                    self.handle_failure(&token, node, None, &error, None, report)
                        .await?;
                    return Ok(StepFlow::Stop);
                }
                let routes = targets
                    .iter()
                    .map(|t| Ok((self.edge(node, t)?, RoutingMode::Copy)))
                    .collect::<Result<Vec<_>, AuditflowError>>()?;
                let reason = json!({ "fork": targets });
                self.landscape
                    .record_routing_events(&state_id, &routes, Some(&reason))?;
                let (children, group) = self.landscape.fork_token(
                    &self.run_id,
                    &token.token_id,
                    &token.row_id,
                    &targets,
                    sequence,
                )?;
                Ok(StepFlow::Spawn(
                    children
                        .iter()
                        .zip(&targets)
                        .map(|(child, branch)| token.forked(child.token_id.clone(), branch, &group))
                        .collect(),
                ))
            }
        }
    }

    fn edge(&self, node_id: &str, label: &str) -> Result<String, AuditflowError> {
        self.landscape
            .find_edge(&self.run_id, node_id, label)?
            .map(|edge| edge.edge_id)
            .ok_or_else(|| {
                LandscapeError::Integrity(format!("no edge '{label}' registered from '{node_id}'"))
                    .into()
            })
    }

    async fn buffer(
        &self,
        token: TokenInfo,
        step: usize,
        trigger_count: usize,
        report: &mut RowReport,
    ) -> Result<StepFlow, AuditflowError> {
        let node_id = self.pipeline.step_node_id(step);
        token.contract.verify_pipeline_row(&node_id, &token.data)?;
        report.touch(&token.token_id, &node_id);
        report.touched_aggregation = true;

        let ready = {
            let mut buffers = self.buffers.lock();
            let buffer = buffers.entry(step).or_insert_with(BatchBuffer::new);
            self.landscape.record_token_outcome(
                &self.run_id,
                &token.token_id,
                RowOutcome::Buffered,
                &OutcomeDetails::batch(&buffer.batch_id),
            )?;
            buffer.tokens.push(token);
            if buffer.tokens.len() >= trigger_count {
                Some(std::mem::replace(buffer, BatchBuffer::new()))
            } else {
                None
            }
        };

        match ready {
            Some(batch) => Ok(StepFlow::Spawn(self.flush_batch(step, batch, report).await?)),
            None => Ok(StepFlow::Stop),
        }
    }

    async fn flush_batch(
        &self,
        step: usize,
        batch: BatchBuffer,
        report: &mut RowReport,
    ) -> Result<Vec<TokenInfo>, AuditflowError> {
        let Some(Step::Aggregation {
            plugin, on_error, ..
        }) = self.pipeline.steps().get(step)
        else {
            return Err(AuditflowError::pipeline(format!("step {step} is not an aggregation")));
        };
        let Some(last) = batch.tokens.last() else {
            return Ok(Vec::new());
        };
        let node_id = self.pipeline.step_node_id(step);
        let sequence = self.pipeline.step_sequence(step);
        let rows: Vec<RowData> = batch.tokens.iter().map(|t| t.data.clone()).collect();
        let input = RowData::new().with(
            "batch",
            RowValue::Array(rows.iter().cloned().map(RowValue::from).collect()),
        );

        let this = self;
        let (node, rows_ref, input_ref) = (node_id.as_str(), rows.as_slice(), &input);
        let result = self
            .retry
            .execute(
                move |attempt| this.batch_attempt(last, node, sequence, attempt, plugin, rows_ref, input_ref),
                is_retryable_plugin_error,
                |attempt, error| this.note_retry(last, node, attempt, error),
            )
            .await;
        report.touch(&last.token_id, node);

        let outputs = match result {
            Ok(AttemptOutput::Rows(outputs, _)) => outputs,
            Ok(AttemptOutput::Pending) => {
                debug!(batch_id = %batch.batch_id, node_id = node, "batch pending");
                for _ in &batch.tokens {
                    report.record(TokenDisposition::Pending);
                }
                return Ok(Vec::new());
            }
            Err(err) => {
                let (error, attempts) = match err {
                    RetryError::Fatal(AuditflowError::Plugin(e)) => (e, None),
                    RetryError::Exhausted(MaxRetriesExceeded {
                        attempts,
                        last_error: AuditflowError::Plugin(e),
                    }) => (e, Some(attempts)),
                    other => return Err(other.into_last_error()),
                };
                for token in &batch.tokens {
                    self.handle_failure(token, node, on_error.as_deref(), &error, attempts, report)
                        .await?;
                }
                return Ok(Vec::new());
            }
        };

        let parent_ids: Vec<String> = batch.tokens.iter().map(|t| t.token_id.clone()).collect();
        for token in &batch.tokens {
            self.landscape.record_token_outcome(
                &self.run_id,
                &token.token_id,
                RowOutcome::ConsumedInBatch,
                &OutcomeDetails::batch(&batch.batch_id),
            )?;
        }
        let mut children = Vec::with_capacity(outputs.len());
        for row in outputs {
            let child = self
                .landscape
                .create_child_token(&parent_ids, &last.row_id, sequence)?;
            children.push(TokenInfo {
                branch: None,
                fork_group_id: None,
                ..last.child(child.token_id, row)
            });
        }
        self.events.try_emit(
            names::BATCH_FLUSHED,
            Some(json!({
                "run_id": self.run_id,
                "node_id": node,
                "batch_id": batch.batch_id,
                "consumed": parent_ids.len(),
                "produced": children.len(),
            })),
        );
        Ok(children)
    }

    #[allow(clippy::too_many_arguments)]
    async fn batch_attempt(
        &self,
        last: &TokenInfo,
        node_id: &str,
        sequence: i64,
        attempt: u32,
        plugin: &Arc<dyn BatchTransform>,
        rows: &[RowData],
        input: &RowData,
    ) -> Result<AttemptOutput, AuditflowError> {
        let target = self.target(last, node_id, sequence, attempt);
        run_in_node_state::<_, AuditflowError, _, _>(&self.landscape, target, input, |state| async move {
            let ctx = self.context(node_id).with_state(state.state_id());
            match plugin.process_batch(rows, &ctx).await {
                TransformResult::Success(row) => {
                    state.succeed(&RowValue::from(row.clone()))?;
                    Ok(AttemptOutput::Rows(vec![row], false))
                }
                TransformResult::Multi(outputs) => {
                    let output = RowValue::Array(outputs.iter().cloned().map(RowValue::from).collect());
                    state.succeed(&output)?;
                    Ok(AttemptOutput::Rows(outputs, true))
                }
                TransformResult::Pending => {
                    state.complete(NodeStateStatus::Pending, None, None)?;
                    Ok(AttemptOutput::Pending)
                }
                TransformResult::Error { reason, retryable } => {
                    Err(plugin_failure(plugin.name(), reason, retryable).into())
                }
            }
        })
        .await
    }

    async fn coalesce(
        &self,
        token: TokenInfo,
        step: usize,
        branches: &[String],
        policy: MergePolicy,
        joins: &mut BTreeMap<JoinKey, HashMap<String, TokenInfo>>,
        report: &mut RowReport,
    ) -> Result<StepFlow, AuditflowError> {
        let (Some(branch), Some(group)) = (token.branch.clone(), token.fork_group_id.clone()) else {
            return Ok(StepFlow::Next(token));
        };
        if !branches.contains(&branch) {
            return Ok(StepFlow::Next(token));
        }
        let node_id = self.pipeline.step_node_id(step);
        let sequence = self.pipeline.step_sequence(step);
        token.contract.verify_pipeline_row(&node_id, &token.data)?;

        let current = &token;
        let target = self.target(current, &node_id, sequence, 1);
        run_in_node_state::<(), AuditflowError, _, _>(&self.landscape, target, &token.data, |state| async move {
            state.succeed(&RowValue::from(current.data.clone()))?;
            Ok(())
        })
        .await?;
        report.touch(&token.token_id, &node_id);

        let key = (step, group);
        let arrived = joins.entry(key.clone()).or_default();
        arrived.insert(branch, token);
        if arrived.len() < branches.len() {
            return Ok(StepFlow::Stop);
        }
        let mut arrived = joins.remove(&key).unwrap_or_default();
        let parents: Vec<TokenInfo> = branches.iter().filter_map(|b| arrived.remove(b)).collect();
        let Some(first) = parents.first() else {
            return Ok(StepFlow::Stop);
        };

        let data = merge_rows(branches, &parents, policy);
        let contract = parents
            .iter()
            .skip(1)
            .fold(first.contract.clone(), |acc, t| acc.merge(&t.contract))
            .narrow(&data);
        let parent_ids: Vec<String> = parents.iter().map(|t| t.token_id.clone()).collect();
        let merged = self
            .landscape
            .coalesce_tokens(&self.run_id, &parent_ids, &first.row_id, sequence)?;
        debug!(token_id = %merged.token_id, parents = parent_ids.len(), "tokens coalesced");
        Ok(StepFlow::Next(TokenInfo::new(
            merged.token_id,
            first.row_id.clone(),
            first.row_index,
            data,
            contract,
        )))
    }

    /// Flushes every non-empty aggregation buffer, in step order, and
    /// carries the outputs through the remaining steps.
    ///
    /// # Errors
    ///
    /// Returns run-stopping errors, as [`TokenProcessor::process_row`].
    pub async fn flush_pending_batches(&self) -> Result<RowReport, AuditflowError> {
        let mut report = RowReport::default();
        for step in 0..self.pipeline.steps().len() {
            let batch = self.buffers.lock().remove(&step);
            let Some(batch) = batch.filter(|b| !b.tokens.is_empty()) else {
                continue;
            };
            debug!(batch_id = %batch.batch_id, tokens = batch.tokens.len(), "flushing partial batch");
            let children = self.flush_batch(step, batch, &mut report).await?;
            let items = children
                .into_iter()
                .map(|token| WorkItem {
                    token,
                    step: step + 1,
                })
                .collect();
            self.run_queue(items, &mut report).await?;
        }
        Ok(report)
    }

    /// Number of tokens currently buffered.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.buffers.lock().values().map(|b| b.tokens.len()).sum()
    }

    /// Encodes the buffered tokens of rows up to `max_row_index` for a
    /// checkpoint. Returns `None` when nothing qualifies.
    ///
    /// # Errors
    ///
    /// Returns an error if a row cannot be tagged-encoded.
    pub fn snapshot_buffers(&self, max_row_index: i64) -> Result<Option<Value>, AuditflowError> {
        let buffers = self.buffers.lock();
        let mut state = serde_json::Map::new();
        for (step, buffer) in buffers.iter() {
            let tokens = buffer
                .tokens
                .iter()
                .filter(|t| t.row_index <= max_row_index)
                .map(|t| {
                    let data = encode_tagged_row(&t.data)?;
                    let contract = serde_json::to_string(&t.contract)
                        .map_err(|e| AuditflowError::pipeline(format!("contract encoding: {e}")))?;
                    Ok(json!({
                        "token_id": t.token_id,
                        "row_id": t.row_id,
                        "row_index": t.row_index,
                        "data": data,
                        "contract": contract,
                    }))
                })
                .collect::<Result<Vec<_>, AuditflowError>>()?;
            if tokens.is_empty() {
                continue;
            }
            state.insert(
                self.pipeline.step_node_id(*step),
                json!({ "batch_id": buffer.batch_id, "tokens": tokens }),
            );
        }
        drop(buffers);
        Ok((!state.is_empty()).then_some(Value::Object(state)))
    }

    /// Restores buffers written by [`TokenProcessor::snapshot_buffers`].
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] if the state names an
    /// unknown node or is malformed.
    pub fn restore_buffers(&self, state: &Value) -> Result<usize, AuditflowError> {
        let malformed = |what: &str| -> AuditflowError {
            LandscapeError::Integrity(format!("checkpoint aggregation state: {what}")).into()
        };
        let Value::Object(nodes) = state else {
            return Err(malformed("not an object"));
        };
        let mut restored = BTreeMap::new();
        let mut count = 0;
        for (node_id, entry) in nodes {
            let step = (0..self.pipeline.steps().len())
                .find(|i| self.pipeline.step_node_id(*i) == *node_id)
                .ok_or_else(|| malformed(&format!("unknown node '{node_id}'")))?;
            let batch_id = entry["batch_id"]
                .as_str()
                .ok_or_else(|| malformed("missing batch_id"))?;
            let tokens = entry["tokens"]
                .as_array()
                .ok_or_else(|| malformed("missing tokens"))?
                .iter()
                .map(|t| {
                    let text = |key: &str| {
                        t[key]
                            .as_str()
                            .map(str::to_string)
                            .ok_or_else(|| malformed(&format!("missing {key}")))
                    };
                    let contract: SchemaContract = serde_json::from_str(&text("contract")?)
                        .map_err(|e| malformed(&format!("contract: {e}")))?;
                    Ok(TokenInfo::new(
                        text("token_id")?,
                        text("row_id")?,
                        t["row_index"].as_i64().ok_or_else(|| malformed("missing row_index"))?,
                        decode_tagged_row(&t["data"])?,
                        contract,
                    ))
                })
                .collect::<Result<Vec<_>, AuditflowError>>()?;
            count += tokens.len();
            restored.insert(
                step,
                BatchBuffer {
                    batch_id: batch_id.to_string(),
                    tokens,
                },
            );
        }
        self.buffers.lock().extend(restored);
        debug!(tokens = count, "aggregation buffers restored");
        Ok(count)
    }
}

fn is_retryable_plugin_error(error: &AuditflowError) -> bool {
    matches!(error, AuditflowError::Plugin(e) if e.retryable)
}

fn plugin_failure(plugin: &str, reason: Value, retryable: bool) -> PluginError {
    let message = reason
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| reason.to_string(), str::to_string);
    PluginError {
        retryable,
        ..PluginError::new(plugin, message).with_detail(reason)
    }
}

fn merge_rows(branches: &[String], parents: &[TokenInfo], policy: MergePolicy) -> RowData {
    match policy {
        MergePolicy::Union => {
            let mut merged = RowData::new();
            for parent in parents {
                for (key, value) in parent.data.iter() {
                    merged.insert(key.clone(), value.clone());
                }
            }
            merged
        }
        MergePolicy::Nested => branches
            .iter()
            .zip(parents)
            .fold(RowData::new(), |row, (branch, parent)| {
                row.with(branch.clone(), RowValue::from(parent.data.clone()))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{FieldContract, FieldType};
    use crate::events::CollectingEventSink;
    use crate::landscape::NodeStateStatus;
    use crate::retry::RetryConfig;
    use crate::testing::{
        CollectSink, FailingTransform, FieldGate, FlakyTransform, ListSource, MapTransform,
        PendingSink, SumBatch,
    };
    use pretty_assertions::assert_eq;

    struct Harness {
        landscape: Arc<Landscape>,
        processor: TokenProcessor,
        events: Arc<CollectingEventSink>,
        source_node: String,
    }

    fn contract() -> SchemaContract {
        SchemaContract::fixed(vec![
            FieldContract::declared("id", FieldType::Int, true),
            FieldContract::declared("name", FieldType::Text, true),
        ])
    }

    fn harness(pipeline: Pipeline) -> Harness {
        let landscape = Arc::new(Landscape::open_in_memory().unwrap());
        let run = landscape.begin_run(&json!({})).unwrap();
        for node in pipeline.node_registrations() {
            landscape.register_node(&run.run_id, node).unwrap();
        }
        for edge in pipeline.edges() {
            landscape
                .register_edge(&run.run_id, &edge.from, &edge.to, &edge.label, edge.mode)
                .unwrap();
        }
        let source_node = pipeline.source_node_id();
        let events = Arc::new(CollectingEventSink::new());
        let retry = RetryManager::new(
            RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay_ms(0)
                .with_jitter_ms(0),
        );
        let processor = TokenProcessor::new(
            Arc::clone(&landscape),
            Arc::new(pipeline),
            run.run_id,
            retry,
            Arc::clone(&events) as Arc<dyn EventSink>,
        );
        Harness {
            landscape,
            processor,
            events,
            source_node,
        }
    }

    fn source_token(h: &Harness, index: i64, name: &str) -> TokenInfo {
        let data = RowData::new().with("id", index).with("name", name);
        let row = h
            .landscape
            .create_row(h.processor.run_id(), &h.source_node, index, &data)
            .unwrap();
        let token = h.landscape.create_token(&row.row_id).unwrap();
        TokenInfo::new(token.token_id, row.row_id, index, data, contract())
    }

    fn source() -> Arc<ListSource> {
        Arc::new(ListSource::new("rows", Vec::new()))
    }

    #[tokio::test]
    async fn test_transform_then_sink_completes_once() {
        let sink = Arc::new(CollectSink::new("out"));
        let pipeline = Pipeline::builder("p")
            .source(source())
            .transform(Arc::new(MapTransform::uppercase("upper", "name")))
            .sink(sink.clone())
            .build()
            .unwrap();
        let h = harness(pipeline);
        let token = source_token(&h, 0, "ada");
        let token_id = token.token_id.clone();

        let report = h.processor.process_row(token).await.unwrap();

        assert_eq!(
            report.dispositions,
            vec![TokenDisposition::Completed { sink: "out".into() }]
        );
        assert_eq!(report.last_node_id.as_deref(), Some("sink::out"));
        let outcome = h.landscape.get_token_outcome(&token_id).unwrap().unwrap();
        assert_eq!(outcome.outcome, RowOutcome::Completed);
        assert_eq!(outcome.sink_name.as_deref(), Some("out"));
        let states = h.landscape.get_node_states_for_token(&token_id).unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.status == NodeStateStatus::Completed));
        assert_eq!(sink.rows()[0].get("name"), Some(&RowValue::from("ADA")));
        assert_eq!(h.events.count(names::TOKEN_COMPLETED), 1);
    }

    #[tokio::test]
    async fn test_retry_records_each_attempt() {
        let pipeline = Pipeline::builder("p")
            .source(source())
            .transform(Arc::new(FlakyTransform::new("flaky", 2)))
            .sink(Arc::new(CollectSink::new("out")))
            .build()
            .unwrap();
        let h = harness(pipeline);
        let token = source_token(&h, 0, "ada");
        let token_id = token.token_id.clone();

        let report = h.processor.process_row(token).await.unwrap();

        assert_eq!(report.dispositions.len(), 1);
        let statuses: Vec<_> = h
            .landscape
            .get_node_states_for_token(&token_id)
            .unwrap()
            .into_iter()
            .filter(|s| s.node_id == "step0::flaky")
            .map(|s| (s.attempt, s.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (1, NodeStateStatus::Failed),
                (2, NodeStateStatus::Failed),
                (3, NodeStateStatus::Completed),
            ]
        );
        assert_eq!(h.events.count(names::TOKEN_RETRYING), 2);
    }

    #[tokio::test]
    async fn test_failure_without_destination_fails_token() {
        let pipeline = Pipeline::builder("p")
            .source(source())
            .transform(Arc::new(FailingTransform::new("bad", "boom")))
            .sink(Arc::new(CollectSink::new("out")))
            .build()
            .unwrap();
        let h = harness(pipeline);
        let token = source_token(&h, 0, "ada");
        let token_id = token.token_id.clone();

        let report = h.processor.process_row(token).await.unwrap();

        assert_eq!(report.dispositions, vec![TokenDisposition::Failed]);
        let outcome = h.landscape.get_token_outcome(&token_id).unwrap().unwrap();
        assert_eq!(outcome.outcome, RowOutcome::Failed);
        assert!(outcome.error_hash.is_some());
    }

    #[tokio::test]
    async fn test_failure_quarantined_to_sink() {
        let review = Arc::new(CollectSink::new("review"));
        let pipeline = Pipeline::builder("p")
            .source(source())
            .transform_on_error(Arc::new(FailingTransform::new("bad", "boom")), "review")
            .sink(Arc::new(CollectSink::new("out")))
            .sink(review.clone())
            .build()
            .unwrap();
        let h = harness(pipeline);
        let token = source_token(&h, 0, "ada");
        let token_id = token.token_id.clone();

        let report = h.processor.process_row(token).await.unwrap();

        assert_eq!(
            report.dispositions,
            vec![TokenDisposition::Quarantined {
                destination: "review".into()
            }]
        );
        assert_eq!(review.len(), 1);
        let errors = h.landscape.get_transform_errors_for_token(&token_id).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].destination, "review");
    }

    #[tokio::test]
    async fn test_gate_routes_to_sink() {
        let review = Arc::new(CollectSink::new("review"));
        let pipeline = Pipeline::builder("p")
            .source(source())
            .gate(
                Arc::new(FieldGate::route_when_equals("check", "name", "bob", "flagged")),
                &[("flagged", "review")],
                &[],
            )
            .sink(Arc::new(CollectSink::new("out")))
            .sink(review.clone())
            .build()
            .unwrap();
        let h = harness(pipeline);

        let routed = h.processor.process_row(source_token(&h, 0, "bob")).await.unwrap();
        let passed = h.processor.process_row(source_token(&h, 1, "ada")).await.unwrap();

        assert_eq!(
            routed.dispositions,
            vec![TokenDisposition::Routed { sink: "review".into() }]
        );
        assert_eq!(
            passed.dispositions,
            vec![TokenDisposition::Completed { sink: "out".into() }]
        );
        assert_eq!(review.len(), 1);
    }

    #[tokio::test]
    async fn test_fork_and_coalesce_union() {
        let sink = Arc::new(CollectSink::new("out"));
        let pipeline = Pipeline::builder("p")
            .source(source())
            .gate(Arc::new(FieldGate::fork("split", &["left", "right"])), &[], &["left", "right"])
            .branch_transform("left", Arc::new(MapTransform::set("tag_left", "left_seen", true)))
            .branch_transform("right", Arc::new(MapTransform::set("tag_right", "right_seen", true)))
            .coalesce("join", &["left", "right"], MergePolicy::Union)
            .sink(sink.clone())
            .build()
            .unwrap();
        let h = harness(pipeline);
        let token = source_token(&h, 0, "ada");
        let parent_id = token.token_id.clone();

        let report = h.processor.process_row(token).await.unwrap();

        assert_eq!(report.dispositions.len(), 1);
        let rows = sink.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("left_seen"), Some(&RowValue::Bool(true)));
        assert_eq!(rows[0].get("right_seen"), Some(&RowValue::Bool(true)));
        let outcome = h.landscape.get_token_outcome(&parent_id).unwrap().unwrap();
        assert_eq!(outcome.outcome, RowOutcome::Forked);
    }

    #[tokio::test]
    async fn test_aggregation_consumes_batch() {
        let sink = Arc::new(CollectSink::new("out"));
        let pipeline = Pipeline::builder("p")
            .source(source())
            .aggregation(Arc::new(SumBatch::new("sum", "id")), 2, None)
            .sink(sink.clone())
            .build()
            .unwrap();
        let h = harness(pipeline);
        let first = source_token(&h, 1, "a");
        let first_id = first.token_id.clone();

        let buffered = h.processor.process_row(first).await.unwrap();
        assert!(buffered.dispositions.is_empty());
        assert_eq!(h.processor.buffered_count(), 1);
        assert_eq!(
            h.landscape.get_token_outcome(&first_id).unwrap().unwrap().outcome,
            RowOutcome::Buffered
        );

        let flushed = h.processor.process_row(source_token(&h, 2, "b")).await.unwrap();
        assert_eq!(flushed.dispositions.len(), 1);
        assert_eq!(sink.rows()[0].get("sum"), Some(&RowValue::Int(3)));
        assert_eq!(
            h.landscape.get_token_outcome(&first_id).unwrap().unwrap().outcome,
            RowOutcome::ConsumedInBatch
        );
        assert_eq!(h.events.count(names::BATCH_FLUSHED), 1);
    }

    #[tokio::test]
    async fn test_buffer_snapshot_restores() {
        let pipeline = Pipeline::builder("p")
            .source(source())
            .aggregation(Arc::new(SumBatch::new("sum", "id")), 5, None)
            .sink(Arc::new(CollectSink::new("out")))
            .build()
            .unwrap();
        let h = harness(pipeline.clone());
        h.processor.process_row(source_token(&h, 0, "a")).await.unwrap();
        h.processor.process_row(source_token(&h, 1, "b")).await.unwrap();

        let state = h.processor.snapshot_buffers(0).unwrap().unwrap();
        let restored = TokenProcessor::new(
            Arc::clone(&h.landscape),
            Arc::new(pipeline),
            h.processor.run_id(),
            RetryManager::new(RetryConfig::no_retry()),
            Arc::new(CollectingEventSink::new()),
        );
        assert_eq!(restored.restore_buffers(&state).unwrap(), 1);
        assert_eq!(restored.buffered_count(), 1);
        assert!(h.processor.snapshot_buffers(-1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_sink_leaves_no_outcome() {
        let pipeline = Pipeline::builder("p")
            .source(source())
            .sink(Arc::new(PendingSink::new("slow")))
            .build()
            .unwrap();
        let h = harness(pipeline);
        let token = source_token(&h, 0, "ada");
        let token_id = token.token_id.clone();

        let report = h.processor.process_row(token).await.unwrap();

        assert_eq!(report.dispositions, vec![TokenDisposition::Pending]);
        assert!(h.landscape.get_token_outcome(&token_id).unwrap().is_none());
        let states = h.landscape.get_node_states_for_token(&token_id).unwrap();
        assert_eq!(states[0].status, NodeStateStatus::Pending);
    }

    #[tokio::test]
    async fn test_empty_expansion_completes_parent() {
        let sink = Arc::new(CollectSink::new("out"));
        let pipeline = Pipeline::builder("p")
            .source(source())
            .transform(Arc::new(MapTransform::explode("split", "tags")))
            .sink(sink.clone())
            .build()
            .unwrap();
        let h = harness(pipeline);
        let data = RowData::new()
            .with("id", 0_i64)
            .with("tags", RowValue::Array(Vec::new()));
        let row = h
            .landscape
            .create_row(h.processor.run_id(), &h.source_node, 0, &data)
            .unwrap();
        let token = h.landscape.create_token(&row.row_id).unwrap();
        let token_id = token.token_id.clone();
        let contract = SchemaContract::fixed(vec![
            FieldContract::declared("id", FieldType::Int, true),
            FieldContract::declared("tags", FieldType::Object, true),
        ]);

        let report = h
            .processor
            .process_row(TokenInfo::new(token.token_id, row.row_id.clone(), 0, data, contract))
            .await
            .unwrap();

        assert_eq!(report.dispositions, vec![TokenDisposition::Filtered]);
        let outcome = h.landscape.get_token_outcome(&token_id).unwrap().unwrap();
        assert_eq!(outcome.outcome, RowOutcome::Completed);
        assert_eq!(outcome.expand_group_id, None);
        assert_eq!(outcome.context.unwrap()["reason"], "no output rows");
        assert_eq!(h.landscape.get_tokens_for_row(&row.row_id).unwrap().len(), 1);
        assert!(sink.rows().is_empty());
    }
}
