//! Run orchestration.
//!
//! The [`Orchestrator`] owns a run from `begin_run` to `finalize_run`:
//! it registers the pipeline's nodes and edges, loads and validates the
//! source, creates every row in the ledger, then dispatches rows to a
//! bounded worker pool. Each worker drives one row through a shared
//! [`TokenProcessor`]. Checkpoints are written at a contiguous row
//! watermark, so every row at or below it is fully finished.

use super::pipeline::{Pipeline, Step, DISCARD};
use super::processor::{RowReport, TokenProcessor};
use super::summary::{RunCounters, RunResult, RunResultStatus, RunSummary};
use super::token::TokenInfo;
use crate::cancellation::ShutdownSignal;
use crate::canonical::stable_hash_row;
use crate::checkpoint::{CheckpointManager, RecoveryError, RecoveryManager};
use crate::contracts::{RowSchema, SchemaContract};
use crate::errors::{AuditflowError, GracefulShutdownError};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::guards::{track_operation, OperationOutcome};
use crate::landscape::{
    Landscape, LineageQuery, LineageResult, OperationType, PurgeReport, RunStatus,
};
use crate::observability::{run_span, token_span};
use crate::plugins::{PluginContext, SinkWrite, SourceRow};
use crate::retry::RetryManager;
use crate::settings::EngineSettings;
use crate::utils::now_utc;
use crate::values::{RowData, RowValue};
use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};

/// A source row admitted into the ledger and waiting for dispatch.
#[derive(Debug, Clone)]
struct AdmittedRow {
    row_id: String,
    row_index: i64,
    data: RowData,
}

/// Last finished token and node at the row watermark.
type Anchor = (String, String);

/// Tracks which rows have finished and the highest index below which
/// every row is done.
#[derive(Debug, Default)]
struct Watermark {
    order: Vec<i64>,
    next: usize,
    finished: HashMap<i64, Option<Anchor>>,
    index: Option<i64>,
    anchor: Option<Anchor>,
    checkpointed: Option<i64>,
}

impl Watermark {
    fn new(order: Vec<i64>) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    /// Marks a row finished and returns how many rows the watermark
    /// moved past.
    fn finish(&mut self, row_index: i64, anchor: Option<Anchor>) -> u64 {
        self.finished.insert(row_index, anchor);
        let mut advanced = 0;
        while let Some(index) = self.order.get(self.next).copied() {
            let Some(anchor) = self.finished.remove(&index) else {
                break;
            };
            if anchor.is_some() {
                self.anchor = anchor;
            }
            self.index = Some(index);
            self.next += 1;
            advanced += 1;
        }
        advanced
    }

    fn needs_checkpoint(&self) -> bool {
        self.index.is_some() && self.index != self.checkpointed
    }
}

enum Stop {
    Shutdown,
    Fatal(AuditflowError),
}

/// Per-run state shared by fresh and resumed runs.
struct RunState {
    run_id: String,
    pipeline: Arc<Pipeline>,
    processor: Arc<TokenProcessor>,
    checkpoints: CheckpointManager,
    contract: SchemaContract,
    counters: RunCounters,
    started: Instant,
    final_anchor: Option<(i64, Anchor)>,
}

/// Drives runs of a [`Pipeline`] against a [`Landscape`].
#[derive(Debug, Clone)]
pub struct Orchestrator {
    landscape: Arc<Landscape>,
    settings: EngineSettings,
    events: Arc<dyn EventSink>,
    shutdown: ShutdownSignal,
}

impl Orchestrator {
    /// Creates an orchestrator over an open ledger.
    ///
    /// # Errors
    ///
    /// Returns [`AuditflowError::Settings`] if the settings are invalid.
    pub fn new(landscape: Arc<Landscape>, settings: EngineSettings) -> Result<Self, AuditflowError> {
        settings.validate()?;
        Ok(Self {
            landscape,
            settings,
            events: Arc::new(NoOpEventSink),
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Opens the ledger described by `settings.landscape`.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or the ledger cannot
    /// be opened.
    pub fn from_settings(settings: EngineSettings) -> Result<Self, AuditflowError> {
        let landscape = Arc::new(settings.landscape.open()?);
        Self::new(landscape, settings)
    }

    /// Sets the telemetry sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Shares a shutdown signal, e.g. one wired to
    /// [`crate::cancellation::install_signal_handlers`].
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// The ledger.
    #[must_use]
    pub const fn landscape(&self) -> &Arc<Landscape> {
        &self.landscape
    }

    /// The shutdown signal checked between row dispatches.
    #[must_use]
    pub const fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Runs `pipeline` from the start of its source.
    ///
    /// # Errors
    ///
    /// Returns the fatal error after finalizing the run as failed, or
    /// [`AuditflowError::Shutdown`] with the counters so far after
    /// finalizing it as interrupted.
    pub async fn run(&self, pipeline: Pipeline) -> Result<RunResult, AuditflowError> {
        let pipeline = Arc::new(pipeline);
        let snapshot = json!({
            "engine": self.settings.snapshot()?,
            "pipeline": pipeline.describe(),
        });
        let run = self.landscape.begin_run(&snapshot)?;
        let span = run_span(&run.run_id, pipeline.name());
        self.run_fresh(run.run_id, pipeline).instrument(span).await
    }

    async fn run_fresh(&self, run_id: String, pipeline: Arc<Pipeline>) -> Result<RunResult, AuditflowError> {
        let started = Instant::now();
        info!(run_id = %run_id, pipeline = pipeline.name(), "run started");
        self.events.try_emit(
            names::RUN_STARTED,
            Some(json!({ "run_id": run_id, "pipeline": pipeline.name() })),
        );

        let prepared = self.prepare(&run_id, &pipeline).await;
        let (rows, contract, counters) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.abort(&run_id, &pipeline, e).await),
        };
        let processor = Arc::new(self.processor(&run_id, &pipeline));
        let checkpoints = CheckpointManager::new(
            Arc::clone(&self.landscape),
            run_id.clone(),
            self.settings.checkpoint.clone(),
        )?;
        let state = RunState {
            run_id,
            pipeline,
            processor,
            checkpoints,
            contract,
            counters,
            started,
            final_anchor: None,
        };
        self.execute(state, rows).await
    }

    /// Resumes a failed or interrupted run from its latest checkpoint.
    ///
    /// Aggregation buffers captured in the checkpoint are restored and
    /// every row past it is processed again with a fresh token. Counters
    /// in the result cover the resumed work only.
    ///
    /// # Errors
    ///
    /// Returns [`AuditflowError::Recovery`] if the run cannot be resumed;
    /// otherwise as [`Orchestrator::run`].
    pub async fn resume(&self, run_id: &str, pipeline: Pipeline) -> Result<RunResult, AuditflowError> {
        let pipeline = Arc::new(pipeline);
        let span = run_span(run_id, pipeline.name());
        self.resume_inner(run_id, pipeline).instrument(span).await
    }

    async fn resume_inner(&self, run_id: &str, pipeline: Arc<Pipeline>) -> Result<RunResult, AuditflowError> {
        let started = Instant::now();
        let recovery = RecoveryManager::new(Arc::clone(&self.landscape));
        recovery.check_resumable(run_id)?;
        let point = recovery.get_resume_point(run_id)?;
        let schema = pipeline.source().schema();
        let restored = recovery.get_unprocessed_row_data(run_id, schema.as_ref())?;
        let Some(schema) = schema else {
            return Err(RecoveryError::MissingSourceSchema {
                run_id: run_id.to_string(),
            }
            .into());
        };
        let contract = restored
            .first()
            .map_or_else(|| schema.clone(), |(_, first)| schema.finalize_with_row(first));

        self.landscape.reopen_run(run_id)?;
        info!(
            run_id,
            after_row = point.row_index,
            rows = restored.len(),
            "resuming run"
        );
        self.events.try_emit(
            names::RUN_RESUMED,
            Some(json!({
                "run_id": run_id,
                "checkpoint_sequence": point.checkpoint.sequence_number,
                "rows": restored.len(),
            })),
        );

        let processor = Arc::new(self.processor(run_id, &pipeline));
        if let Some(state) = &point.aggregation_state {
            if let Err(e) = processor.restore_buffers(state) {
                return Err(self.abort(run_id, &pipeline, e).await);
            }
        }
        if let Err(e) = self.start_plugins(run_id, &pipeline).await {
            return Err(self.abort(run_id, &pipeline, e).await);
        }
        let rows = restored
            .into_iter()
            .map(|(row, data)| AdmittedRow {
                row_id: row.row_id,
                row_index: row.row_index,
                data,
            })
            .collect();
        let checkpoints = CheckpointManager::new(
            Arc::clone(&self.landscape),
            run_id,
            self.settings.checkpoint.clone(),
        )?;
        let state = RunState {
            run_id: run_id.to_string(),
            pipeline,
            processor,
            checkpoints,
            contract,
            counters: RunCounters::default(),
            started,
            final_anchor: None,
        };
        self.execute(state, rows).await
    }

    /// Lineage of one token.
    ///
    /// # Errors
    ///
    /// Returns [`AuditflowError::Explain`] if the query does not resolve
    /// to exactly one token.
    pub fn explain(&self, run_id: &str, query: &LineageQuery) -> Result<LineageResult, AuditflowError> {
        Ok(self.landscape.explain(run_id, query)?)
    }

    /// Purges a finished run's payloads if it is older than
    /// `payload_retention_days`. Returns `None` when retention is off or
    /// the run is too recent.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is still running or the purge fails.
    pub fn purge_if_expired(&self, run_id: &str) -> Result<Option<PurgeReport>, AuditflowError> {
        let Some(days) = self.settings.payload_retention_days else {
            return Ok(None);
        };
        let run = self.landscape.get_run(run_id)?;
        let finished = run.completed_at.unwrap_or(run.started_at);
        if now_utc() - finished < chrono::Duration::days(i64::from(days)) {
            return Ok(None);
        }
        let report = self.landscape.purge_payloads(run_id)?;
        info!(
            run_id,
            rows = report.rows_purged,
            grade = ?report.grade_after,
            "payloads purged by retention"
        );
        Ok(Some(report))
    }

    fn processor(&self, run_id: &str, pipeline: &Arc<Pipeline>) -> TokenProcessor {
        TokenProcessor::new(
            Arc::clone(&self.landscape),
            Arc::clone(pipeline),
            run_id,
            RetryManager::new(self.settings.retry.clone()),
            Arc::clone(&self.events),
        )
    }

    fn plugin_context(&self, run_id: &str, node_id: &str) -> PluginContext {
        PluginContext::new(Arc::clone(&self.landscape), run_id, node_id)
    }

    async fn start_plugins(&self, run_id: &str, pipeline: &Pipeline) -> Result<(), AuditflowError> {
        for (node_id, plugin) in pipeline.plugins() {
            plugin.on_start(&self.plugin_context(run_id, &node_id)).await?;
        }
        Ok(())
    }

    async fn finish_plugins(&self, run_id: &str, pipeline: &Pipeline, completed: bool) -> Result<(), AuditflowError> {
        let mut first_error = None;
        for (node_id, plugin) in pipeline.plugins() {
            if completed {
                if let Err(e) = plugin.on_complete(&self.plugin_context(run_id, &node_id)).await {
                    warn!(node_id = %node_id, error = %e, "on_complete failed");
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = plugin.close().await {
                warn!(node_id = %node_id, error = %e, "close failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Registers the graph, starts plugins, loads and validates the
    /// source, and creates a ledger row for every valid input.
    async fn prepare(
        &self,
        run_id: &str,
        pipeline: &Pipeline,
    ) -> Result<(Vec<AdmittedRow>, SchemaContract, RunCounters), AuditflowError> {
        for node in pipeline.node_registrations() {
            self.landscape.register_node(run_id, node)?;
        }
        for edge in pipeline.edges() {
            self.landscape
                .register_edge(run_id, &edge.from, &edge.to, &edge.label, edge.mode)?;
        }
        self.start_plugins(run_id, pipeline).await?;

        let source = pipeline.source();
        let source_node = pipeline.source_node_id();
        let node = source_node.as_str();
        let loaded = track_operation::<_, AuditflowError, _, _>(
            &self.landscape,
            run_id,
            node,
            OperationType::SourceLoad,
            |op| async move {
                let ctx = self.plugin_context(run_id, node).with_operation(op.operation_id());
                let rows = source.load(&ctx).await?;
                op.set_metadata(json!({ "rows": rows.len() }));
                Ok(OperationOutcome::Completed(rows))
            },
        )
        .await?
        .into_inner();

        let mut contract = source.schema().unwrap_or_else(SchemaContract::observed);
        let mut counters = RunCounters::default();
        let mut admitted = Vec::with_capacity(loaded.len());
        for (position, loaded_row) in loaded.into_iter().enumerate() {
            let row_index = i64::try_from(position)
                .map_err(|_| AuditflowError::pipeline("source yielded too many rows"))?;
            let raw = match loaded_row {
                SourceRow::Valid(raw) => raw,
                SourceRow::Quarantined { raw, reason } => {
                    self.quarantine_source_row(run_id, pipeline, &contract, raw, &reason)
                        .await?;
                    counters.rows_processed += 1;
                    counters.rows_quarantined += 1;
                    continue;
                }
            };
            if !contract.is_locked() {
                contract = contract.finalize_with_row(&raw);
                debug!(run_id, fields = contract.fields().len(), "source contract locked");
            }
            // NaN and infinities cannot be hashed into the ledger.
            let checked = RowSchema::for_source(contract.clone())
                .check(node, &raw)
                .map_err(|violation| violation.to_string())
                .and_then(|clean| match stable_hash_row(&clean) {
                    Ok(_) => Ok(clean),
                    Err(e) => Err(format!("row is not canonically encodable: {e}")),
                });
            match checked {
                Ok(clean) => {
                    let row = self.landscape.create_row(run_id, node, row_index, &clean)?;
                    admitted.push(AdmittedRow {
                        row_id: row.row_id,
                        row_index,
                        data: clean,
                    });
                }
                Err(reason) => {
                    self.quarantine_source_row(
                        run_id,
                        pipeline,
                        &contract,
                        RowValue::from(raw),
                        &reason,
                    )
                    .await?;
                    counters.rows_processed += 1;
                    counters.rows_quarantined += 1;
                }
            }
        }

        info!(
            run_id,
            valid = admitted.len(),
            quarantined = counters.rows_quarantined,
            "source loaded"
        );
        self.events.try_emit(
            names::SOURCE_LOADED,
            Some(json!({
                "run_id": run_id,
                "rows": admitted.len(),
                "quarantined": counters.rows_quarantined,
            })),
        );
        Ok((admitted, contract, counters))
    }

    async fn quarantine_source_row(
        &self,
        run_id: &str,
        pipeline: &Pipeline,
        contract: &SchemaContract,
        raw: RowValue,
        reason: &str,
    ) -> Result<(), AuditflowError> {
        let source_node = pipeline.source_node_id();
        let destination = pipeline.source().on_validation_failure().to_string();
        let record = self.landscape.record_validation_error(
            run_id,
            Some(source_node.as_str()),
            &raw,
            reason,
            contract.mode(),
            &destination,
        )?;
        debug!(run_id, row_hash = %record.row_hash, destination = %destination, "source row quarantined");
        self.events.try_emit(
            names::ROW_QUARANTINED,
            Some(json!({ "run_id": run_id, "destination": destination, "reason": reason })),
        );
        if destination == DISCARD {
            return Ok(());
        }

        let sink = pipeline
            .sink(&destination)
            .ok_or_else(|| AuditflowError::pipeline(format!("unknown destination '{destination}'")))?;
        let row = match raw {
            RowValue::Map(fields) => RowData::from(fields),
            other => RowData::new().with("raw", other),
        }
        .with("_quarantine_reason", reason);
        let sink_node = pipeline.sink_node_id(&destination);
        let node = sink_node.as_str();
        track_operation::<_, AuditflowError, _, _>(
            &self.landscape,
            run_id,
            node,
            OperationType::SinkWrite,
            |op| async move {
                let ctx = self.plugin_context(run_id, node).with_operation(op.operation_id());
                match sink.write(std::slice::from_ref(&row), &ctx).await? {
                    SinkWrite::Completed(metadata) => {
                        op.set_metadata(metadata);
                        Ok(OperationOutcome::Completed(()))
                    }
                    SinkWrite::Pending => Ok(OperationOutcome::Pending(())),
                }
            },
        )
        .await?;
        Ok(())
    }

    /// Dispatches rows, then finishes the run according to how dispatch
    /// stopped.
    async fn execute(&self, mut state: RunState, rows: Vec<AdmittedRow>) -> Result<RunResult, AuditflowError> {
        let stop = self.dispatch(&mut state, rows).await;
        let stop = match stop {
            None => match state.processor.flush_pending_batches().await {
                Ok(report) => {
                    for disposition in &report.dispositions {
                        state.counters.record(disposition);
                    }
                    None
                }
                Err(e) => Some(Stop::Fatal(e)),
            },
            stop => stop,
        };

        match stop {
            None => self.complete(state).await,
            Some(Stop::Shutdown) => {
                let reason = self.shutdown.reason().unwrap_or_else(|| "shutdown".to_string());
                warn!(run_id = %state.run_id, reason = %reason, "run interrupted");
                self.final_checkpoint(&state);
                if let Err(e) = self.finish_plugins(&state.run_id, &state.pipeline, false).await {
                    warn!(run_id = %state.run_id, error = %e, "plugin shutdown failed");
                }
                self.finalize(&state, RunResultStatus::Interrupted)?;
                Err(GracefulShutdownError {
                    run_id: state.run_id,
                    counters: state.counters,
                }
                .into())
            }
            Some(Stop::Fatal(e)) => {
                error!(run_id = %state.run_id, error = %e, "run failed");
                self.final_checkpoint(&state);
                if let Err(close) = self.finish_plugins(&state.run_id, &state.pipeline, false).await {
                    warn!(run_id = %state.run_id, error = %close, "plugin shutdown failed");
                }
                if let Err(finalize) = self.finalize(&state, RunResultStatus::Failed) {
                    error!(run_id = %state.run_id, error = %finalize, "failed to finalize failed run");
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, state: &mut RunState, rows: Vec<AdmittedRow>) -> Option<Stop> {
        let has_aggregation = state
            .pipeline
            .steps()
            .iter()
            .any(|s| matches!(s, Step::Aggregation { .. }));
        // Batches follow source order, so aggregations get one worker.
        let workers = if has_aggregation {
            1
        } else {
            self.settings.concurrency.max_workers
        };
        let acquire_timeout = Duration::from_millis(self.settings.concurrency.acquire_timeout_ms);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut watermark = Watermark::new(rows.iter().map(|r| r.row_index).collect());
        let mut in_flight: FuturesUnordered<JoinHandle<(i64, Result<RowReport, AuditflowError>)>> =
            FuturesUnordered::new();
        let mut stop = None;

        for row in rows {
            if self.shutdown.is_requested() {
                stop = Some(Stop::Shutdown);
                break;
            }
            let permit = match tokio::time::timeout(acquire_timeout, Arc::clone(&semaphore).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    stop = Some(Stop::Fatal(AuditflowError::pipeline("worker pool closed")));
                    break;
                }
                Err(_) => {
                    stop = Some(Stop::Fatal(AuditflowError::Timeout {
                        what: "a free worker".to_string(),
                        after_ms: self.settings.concurrency.acquire_timeout_ms,
                    }));
                    break;
                }
            };
            while let Some(Some(joined)) = in_flight.next().now_or_never() {
                self.settle(state, &mut watermark, joined, &mut stop);
            }
            if stop.is_none() && self.shutdown.is_requested() {
                stop = Some(Stop::Shutdown);
            }
            if stop.is_some() {
                break;
            }
            match self.spawn_row(state, row, permit) {
                Ok(handle) => in_flight.push(handle),
                Err(e) => {
                    stop = Some(Stop::Fatal(e));
                    break;
                }
            }
            while let Some(Some(joined)) = in_flight.next().now_or_never() {
                self.settle(state, &mut watermark, joined, &mut stop);
            }
            if stop.is_some() {
                break;
            }
        }

        // In-flight rows always reach their current node's terminal state.
        while let Some(joined) = in_flight.next().await {
            self.settle(state, &mut watermark, joined, &mut stop);
        }
        self.store_anchor(state, &watermark);
        stop
    }

    fn spawn_row(
        &self,
        state: &RunState,
        row: AdmittedRow,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> Result<JoinHandle<(i64, Result<RowReport, AuditflowError>)>, AuditflowError> {
        let token = self.landscape.create_token(&row.row_id)?;
        let span = token_span(&state.run_id, &row.row_id, &token.token_id);
        let info = TokenInfo::new(
            token.token_id,
            row.row_id,
            row.row_index,
            row.data,
            state.contract.clone(),
        );
        let processor = Arc::clone(&state.processor);
        let row_index = row.row_index;
        Ok(tokio::spawn(
            async move {
                let result = processor.process_row(info).await;
                drop(permit);
                (row_index, result)
            }
            .instrument(span),
        ))
    }

    fn settle(
        &self,
        state: &mut RunState,
        watermark: &mut Watermark,
        joined: Result<(i64, Result<RowReport, AuditflowError>), JoinError>,
        stop: &mut Option<Stop>,
    ) {
        let report = match joined {
            Ok((_, Ok(report))) => report,
            Ok((row_index, Err(e))) => {
                error!(run_id = %state.run_id, row_index, error = %e, "row processing failed");
                if !matches!(stop, Some(Stop::Fatal(_))) {
                    *stop = Some(Stop::Fatal(e));
                }
                return;
            }
            Err(join) => {
                if !matches!(stop, Some(Stop::Fatal(_))) {
                    *stop = Some(Stop::Fatal(AuditflowError::pipeline(format!(
                        "row worker panicked: {join}"
                    ))));
                }
                return;
            }
        };

        state.counters.rows_processed += 1;
        for disposition in &report.dispositions {
            state.counters.record(disposition);
        }
        let Some(row_index) = report.row_index else {
            return;
        };
        let anchor = report.last_token_id.zip(report.last_node_id);
        let advanced = watermark.finish(row_index, anchor);
        if state.checkpoints.note_progress(advanced, report.touched_aggregation) {
            if let Err(e) = self.write_checkpoint(state, watermark) {
                *stop = Some(Stop::Fatal(e));
            }
        }
    }

    fn write_checkpoint(&self, state: &RunState, watermark: &mut Watermark) -> Result<(), AuditflowError> {
        let (Some(index), Some((token_id, node_id))) = (watermark.index, watermark.anchor.as_ref()) else {
            return Ok(());
        };
        let aggregation_state = state.processor.snapshot_buffers(index)?;
        let checkpoint = state
            .checkpoints
            .write(token_id, node_id, aggregation_state.as_ref())?;
        watermark.checkpointed = Some(index);
        self.events.try_emit(
            names::CHECKPOINT_WRITTEN,
            Some(json!({
                "run_id": state.run_id,
                "sequence": checkpoint.sequence_number,
                "row_index": index,
            })),
        );
        Ok(())
    }

    fn store_anchor(&self, state: &mut RunState, watermark: &Watermark) {
        state.final_anchor = if state.checkpoints.is_enabled() && watermark.needs_checkpoint() {
            watermark.index.zip(watermark.anchor.clone())
        } else {
            None
        };
    }

    fn final_checkpoint(&self, state: &RunState) {
        let Some((index, (token_id, node_id))) = &state.final_anchor else {
            return;
        };
        let written = state
            .processor
            .snapshot_buffers(*index)
            .and_then(|buffers| {
                state
                    .checkpoints
                    .write(token_id, node_id, buffers.as_ref())
                    .map_err(AuditflowError::from)
            });
        match written {
            Ok(checkpoint) => info!(
                run_id = %state.run_id,
                sequence = checkpoint.sequence_number,
                row_index = index,
                "final checkpoint written"
            ),
            Err(e) => error!(run_id = %state.run_id, error = %e, "failed to write final checkpoint"),
        }
    }

    async fn complete(&self, state: RunState) -> Result<RunResult, AuditflowError> {
        if let Err(e) = self.finish_plugins(&state.run_id, &state.pipeline, true).await {
            error!(run_id = %state.run_id, error = %e, "plugin completion failed");
            if let Err(finalize) = self.finalize(&state, RunResultStatus::Failed) {
                error!(run_id = %state.run_id, error = %finalize, "failed to finalize failed run");
            }
            return Err(e);
        }
        let status = RunResultStatus::from_counters(&state.counters);
        let result = self.finalize(&state, status)?;
        let removed = self.landscape.delete_checkpoints(&state.run_id)?;
        debug!(run_id = %state.run_id, removed, "checkpoints cleared");
        Ok(result)
    }

    fn finalize(&self, state: &RunState, status: RunResultStatus) -> Result<RunResult, AuditflowError> {
        self.landscape.finalize_run(&state.run_id, status.ledger_status())?;
        let grade = self.landscape.get_reproducibility_grade(&state.run_id)?;
        let summary = RunSummary {
            run_id: state.run_id.clone(),
            status,
            counters: state.counters.clone(),
            duration_ms: u64::try_from(state.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!(
            run_id = %state.run_id,
            status = %status,
            grade = ?grade,
            processed = summary.counters.rows_processed,
            succeeded = summary.counters.rows_succeeded,
            failed = summary.counters.rows_failed,
            quarantined = summary.counters.rows_quarantined,
            routed = summary.counters.rows_routed,
            "run finished"
        );
        self.events.try_emit(
            names::RUN_COMPLETED,
            serde_json::to_value(&summary).ok(),
        );
        Ok(RunResult { summary, grade })
    }

    /// Finalizes a run that failed before dispatch began.
    async fn abort(&self, run_id: &str, pipeline: &Pipeline, err: AuditflowError) -> AuditflowError {
        error!(run_id, error = %err, "run failed before processing rows");
        if let Err(e) = self.finish_plugins(run_id, pipeline, false).await {
            warn!(run_id, error = %e, "plugin shutdown failed");
        }
        if let Err(e) = self.landscape.finalize_run(run_id, RunStatus::Failed) {
            error!(run_id, error = %e, "failed to finalize failed run");
        }
        self.events.try_emit(
            names::RUN_COMPLETED,
            Some(json!({ "run_id": run_id, "status": RunResultStatus::Failed.to_string() })),
        );
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_watermark_waits_for_gaps() {
        let mut watermark = Watermark::new(vec![0, 1, 3]);
        let anchor = |t: &str| Some((t.to_string(), "sink::out".to_string()));

        assert_eq!(watermark.finish(1, anchor("t1")), 0);
        assert_eq!(watermark.index, None);
        assert_eq!(watermark.finish(0, anchor("t0")), 2);
        assert_eq!(watermark.index, Some(1));
        assert_eq!(watermark.anchor, anchor("t1"));
        assert!(watermark.needs_checkpoint());

        watermark.checkpointed = Some(1);
        assert!(!watermark.needs_checkpoint());
        assert_eq!(watermark.finish(3, anchor("t3")), 1);
        assert_eq!(watermark.index, Some(3));
    }
}
