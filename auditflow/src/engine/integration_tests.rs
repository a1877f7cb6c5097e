//! End-to-end runs through the orchestrator.

use super::*;
use crate::cancellation::ShutdownSignal;
use crate::checkpoint::RecoveryError;
use crate::contracts::{FieldContract, FieldType, SchemaContract};
use crate::errors::AuditflowError;
use crate::events::{names, CollectingEventSink, EventSink};
use crate::landscape::{
    Determinism, Landscape, LineageQuery, ReproducibilityGrade, RowOutcome, RunStatus,
};
use crate::plugins::{Plugin, PluginContext, Sink, Transform, TransformResult};
use crate::retry::RetryConfig;
use crate::settings::{CheckpointFrequency, CheckpointSettings, EngineSettings};
use crate::testing::{
    CollectSink, FailingSink, FailingTransform, FieldGate, ListSource, MapTransform, SumBatch,
};
use crate::values::{RowData, RowValue};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn rows(count: i64) -> Vec<RowData> {
    (1..=count)
        .map(|id| RowData::new().with("id", id).with("name", format!("user{id}")))
        .collect()
}

fn schema() -> SchemaContract {
    SchemaContract::fixed(vec![
        FieldContract::declared("id", FieldType::Int, true),
        FieldContract::declared("name", FieldType::Text, true),
    ])
}

fn settings(workers: usize) -> EngineSettings {
    EngineSettings::default()
        .with_retry(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay_ms(0)
                .with_jitter_ms(0),
        )
        .with_max_workers(workers)
}

fn orchestrator(workers: usize) -> (Orchestrator, Arc<CollectingEventSink>) {
    let landscape = Arc::new(Landscape::open_in_memory().unwrap());
    let events = Arc::new(CollectingEventSink::new());
    let orchestrator = Orchestrator::new(landscape, settings(workers))
        .unwrap()
        .with_events(Arc::clone(&events) as Arc<dyn EventSink>);
    (orchestrator, events)
}

/// Requests shutdown while processing the row whose `id` matches.
#[derive(Debug)]
struct StopAt {
    id: i64,
    signal: ShutdownSignal,
}

#[async_trait]
impl Plugin for StopAt {
    fn name(&self) -> &str {
        "stop_at"
    }
}

#[async_trait]
impl Transform for StopAt {
    async fn process(&self, row: &RowData, _ctx: &PluginContext) -> TransformResult {
        if row.get("id") == Some(&RowValue::Int(self.id)) {
            self.signal.request("test shutdown");
        }
        TransformResult::Success(row.clone())
    }
}

#[tokio::test]
async fn test_clean_run_completes_every_token_once() {
    let (orchestrator, events) = orchestrator(4);
    let sink = Arc::new(CollectSink::new("out"));
    let pipeline = Pipeline::builder("clean")
        .source(Arc::new(ListSource::new("rows", rows(20))))
        .transform(Arc::new(MapTransform::uppercase("upper", "name")))
        .sink(sink.clone())
        .build()
        .unwrap();

    let result = orchestrator.run(pipeline).await.unwrap();

    assert_eq!(result.status(), RunResultStatus::Completed);
    assert_eq!(result.counters().rows_processed, 20);
    assert_eq!(result.counters().rows_succeeded, 20);
    assert_eq!(result.grade, ReproducibilityGrade::ReplayReproducible);
    assert_eq!(sink.len(), 20);
    assert!(sink
        .rows()
        .iter()
        .all(|r| r.get("name").and_then(RowValue::as_str).is_some_and(|n| n.starts_with("USER"))));

    let landscape = orchestrator.landscape();
    let run = landscape.get_run(result.run_id()).unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let outcomes = landscape.get_token_outcomes_for_run(result.run_id()).unwrap();
    assert_eq!(outcomes.len(), 20);
    assert!(outcomes.iter().all(|o| o.outcome == RowOutcome::Completed));
    assert!(landscape.get_checkpoints(result.run_id()).unwrap().is_empty());

    assert_eq!(events.count(names::RUN_STARTED), 1);
    assert_eq!(events.count(names::RUN_COMPLETED), 1);
    assert_eq!(events.count(names::TOKEN_COMPLETED), 20);
}

#[tokio::test]
async fn test_failed_rows_make_run_partial() {
    let (orchestrator, _) = orchestrator(2);
    let pipeline = Pipeline::builder("partial")
        .source(Arc::new(ListSource::new("rows", rows(4))))
        .transform(Arc::new(FailingTransform::new("strict", "bad id").when_equals("id", 2)))
        .sink(Arc::new(CollectSink::new("out")))
        .build()
        .unwrap();

    let result = orchestrator.run(pipeline).await.unwrap();

    assert_eq!(result.status(), RunResultStatus::Partial);
    assert_eq!(result.counters().rows_succeeded, 3);
    assert_eq!(result.counters().rows_failed, 1);
    let run = orchestrator.landscape().get_run(result.run_id()).unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_routed_destinations_in_summary() {
    let (orchestrator, _) = orchestrator(1);
    let review = Arc::new(CollectSink::new("review"));
    let pipeline = Pipeline::builder("routing")
        .source(Arc::new(ListSource::new("rows", rows(3))))
        .gate(
            Arc::new(FieldGate::route_when_equals("check", "id", 3, "flagged")),
            &[("flagged", "review")],
            &[],
        )
        .sink(Arc::new(CollectSink::new("out")))
        .sink(review.clone())
        .build()
        .unwrap();

    let result = orchestrator.run(pipeline).await.unwrap();

    assert_eq!(result.status(), RunResultStatus::Partial);
    assert_eq!(result.counters().rows_succeeded, 2);
    assert_eq!(result.counters().rows_routed, 1);
    assert_eq!(result.counters().routed_destinations.get("review"), Some(&1));
    assert_eq!(review.len(), 1);
}

#[tokio::test]
async fn test_invalid_source_rows_are_quarantined() {
    let (orchestrator, _) = orchestrator(1);
    let quarantine = Arc::new(CollectSink::new("quarantine"));
    let mut input = rows(2);
    input.push(RowData::new().with("id", "not a number").with("name", "bad"));
    let source = ListSource::new("rows", input)
        .with_schema(schema())
        .with_validation_failure("quarantine")
        .with_quarantined("id=?;name", "unparseable line");
    let pipeline = Pipeline::builder("quarantine")
        .source(Arc::new(source))
        .sink(Arc::new(CollectSink::new("out")))
        .sink(quarantine.clone())
        .build()
        .unwrap();

    let result = orchestrator.run(pipeline).await.unwrap();

    assert_eq!(result.status(), RunResultStatus::Partial);
    assert_eq!(result.counters().rows_processed, 4);
    assert_eq!(result.counters().rows_succeeded, 2);
    assert_eq!(result.counters().rows_quarantined, 2);
    assert_eq!(quarantine.len(), 2);

    let landscape = orchestrator.landscape();
    assert_eq!(landscape.get_rows(result.run_id()).unwrap().len(), 2);
    let errors = landscape.get_validation_errors(result.run_id()).unwrap();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.destination == "quarantine"));
}

#[tokio::test]
async fn test_string_ids_coerced_at_source() {
    let (orchestrator, _) = orchestrator(1);
    let sink = Arc::new(CollectSink::new("out"));
    let source = ListSource::new(
        "rows",
        vec![RowData::new().with("id", "7").with("name", "ada")],
    )
    .with_schema(schema());
    let pipeline = Pipeline::builder("coerce")
        .source(Arc::new(source))
        .sink(sink.clone())
        .build()
        .unwrap();

    let result = orchestrator.run(pipeline).await.unwrap();

    assert_eq!(result.status(), RunResultStatus::Completed);
    assert_eq!(sink.rows()[0].get("id"), Some(&RowValue::Int(7)));
}

fn scored(values: &[f64]) -> Vec<RowData> {
    values
        .iter()
        .zip(1_i64..)
        .map(|(score, id)| RowData::new().with("id", id).with("score", *score))
        .collect()
}

#[tokio::test]
async fn test_non_finite_values_quarantined_under_fixed_schema() {
    let (orchestrator, _) = orchestrator(1);
    let sink = Arc::new(CollectSink::new("out"));
    let source = ListSource::new("rows", scored(&[1.5, f64::NAN])).with_schema(SchemaContract::fixed(vec![
        FieldContract::declared("id", FieldType::Int, true),
        FieldContract::declared("score", FieldType::Float, true),
    ]));
    let pipeline = Pipeline::builder("nan_fixed")
        .source(Arc::new(source))
        .sink(sink.clone())
        .build()
        .unwrap();

    let result = orchestrator.run(pipeline).await.unwrap();

    assert_eq!(result.status(), RunResultStatus::Partial);
    assert_eq!(result.counters().rows_processed, 2);
    assert_eq!(result.counters().rows_succeeded, 1);
    assert_eq!(result.counters().rows_quarantined, 1);
    assert_eq!(sink.len(), 1);

    let landscape = orchestrator.landscape();
    assert_eq!(landscape.get_rows(result.run_id()).unwrap().len(), 1);
    let errors = landscape.get_validation_errors(result.run_id()).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].destination, "discard");
    assert!(errors[0].row_data.get("__repr__").is_some());
}

#[tokio::test]
async fn test_non_finite_values_quarantined_under_observed_schema() {
    let (orchestrator, _) = orchestrator(1);
    let sink = Arc::new(CollectSink::new("out"));
    let pipeline = Pipeline::builder("nan_observed")
        .source(Arc::new(ListSource::new("rows", scored(&[1.5, f64::INFINITY, 2.5]))))
        .sink(sink.clone())
        .build()
        .unwrap();

    let result = orchestrator.run(pipeline).await.unwrap();

    assert_eq!(result.status(), RunResultStatus::Partial);
    assert_eq!(result.counters().rows_succeeded, 2);
    assert_eq!(result.counters().rows_quarantined, 1);
    let ids: Vec<Option<i64>> = sink.rows().iter().map(|r| r.get("id").and_then(RowValue::as_i64)).collect();
    assert_eq!(ids, vec![Some(1), Some(3)]);
}

#[tokio::test]
async fn test_expansion_completes_each_child() {
    let (orchestrator, _) = orchestrator(1);
    let sink = Arc::new(CollectSink::new("out"));
    let input = vec![
        RowData::new().with("id", 1).with("tags", RowValue::Array(vec!["a".into(), "b".into()])),
        RowData::new().with("id", 2).with("tags", RowValue::Array(vec!["c".into()])),
    ];
    let pipeline = Pipeline::builder("expand")
        .source(Arc::new(ListSource::new("rows", input)))
        .transform(Arc::new(MapTransform::explode("split", "tags")))
        .sink(sink.clone())
        .build()
        .unwrap();

    let result = orchestrator.run(pipeline).await.unwrap();

    assert_eq!(result.counters().rows_processed, 2);
    assert_eq!(result.counters().rows_succeeded, 3);
    assert_eq!(sink.len(), 3);
    let outcomes = orchestrator
        .landscape()
        .get_token_outcomes_for_run(result.run_id())
        .unwrap();
    let expanded = outcomes.iter().filter(|o| o.outcome == RowOutcome::Expanded).count();
    assert_eq!(expanded, 2);
}

#[tokio::test]
async fn test_aggregation_flushes_partial_batch_at_end() {
    let (orchestrator, events) = orchestrator(4);
    let sink = Arc::new(CollectSink::new("out"));
    let input = (1..=5).map(|n| RowData::new().with("n", n)).collect();
    let pipeline = Pipeline::builder("sums")
        .source(Arc::new(ListSource::new("rows", input)))
        .aggregation(Arc::new(SumBatch::new("sum", "n")), 2, None)
        .sink(sink.clone())
        .build()
        .unwrap();

    let result = orchestrator.run(pipeline).await.unwrap();

    let sums: Vec<Option<i64>> = sink
        .rows()
        .iter()
        .map(|r| r.get("sum").and_then(RowValue::as_i64))
        .collect();
    assert_eq!(sums, vec![Some(3), Some(7), Some(5)]);
    assert_eq!(result.counters().rows_processed, 5);
    assert_eq!(result.counters().rows_succeeded, 3);
    assert_eq!(events.count(names::BATCH_FLUSHED), 3);

    let consumed = orchestrator
        .landscape()
        .get_token_outcomes_for_run(result.run_id())
        .unwrap()
        .into_iter()
        .filter(|o| o.outcome == RowOutcome::ConsumedInBatch)
        .count();
    assert_eq!(consumed, 5);
}

#[tokio::test]
async fn test_deterministic_pipeline_grades_full() {
    let (orchestrator, _) = orchestrator(1);
    let pipeline = Pipeline::builder("pure")
        .source(Arc::new(ListSource::new("rows", rows(1))))
        .transform(Arc::new(MapTransform::identity("noop").with_determinism(Determinism::Seeded)))
        .sink(Arc::new(CollectSink::new("out")))
        .build()
        .unwrap();

    let result = orchestrator.run(pipeline).await.unwrap();

    // The source reads external state.
    assert_eq!(result.grade, ReproducibilityGrade::ReplayReproducible);
    let report = orchestrator.landscape().purge_payloads(result.run_id()).unwrap();
    assert_eq!(report.grade_after, ReproducibilityGrade::AttributableOnly);
}

#[tokio::test]
async fn test_sink_failure_fails_run_then_resume_finishes_it() {
    let (orchestrator, events) = orchestrator(1);
    let build = |sink: Arc<dyn Sink>| {
        Pipeline::builder("resumable")
            .source(Arc::new(ListSource::new("rows", rows(5)).with_schema(schema())))
            .transform(Arc::new(MapTransform::uppercase("upper", "name")))
            .sink(sink)
            .build()
            .unwrap()
    };

    let err = orchestrator
        .run(build(Arc::new(FailingSink::new("out", "disk full").after(2))))
        .await
        .unwrap_err();
    assert!(matches!(err, AuditflowError::Plugin(_)));

    let landscape = Arc::clone(orchestrator.landscape());
    let started = events.events_of_type(names::RUN_STARTED);
    let run_id = started[0].1.as_ref().unwrap()["run_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(landscape.get_run(&run_id).unwrap().status, RunStatus::Failed);

    let sink = Arc::new(CollectSink::new("out"));
    let result = orchestrator.resume(&run_id, build(sink.clone())).await.unwrap();

    assert_eq!(result.status(), RunResultStatus::Completed);
    assert_eq!(result.counters().rows_processed, 3);
    let names: Vec<String> = sink
        .rows()
        .iter()
        .filter_map(|r| r.get("name").and_then(RowValue::as_str).map(str::to_string))
        .collect();
    assert_eq!(names, vec!["USER3", "USER4", "USER5"]);
    assert_eq!(landscape.get_run(&run_id).unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn test_shutdown_interrupts_with_counters_and_resumes() {
    let (orchestrator, _) = orchestrator(1);
    let signal = ShutdownSignal::new();
    let orchestrator = orchestrator.with_shutdown(signal.clone());
    let build = |stop: Arc<StopAt>| {
        Pipeline::builder("interruptible")
            .source(Arc::new(ListSource::new("rows", rows(4)).with_schema(schema())))
            .transform(stop)
            .sink(Arc::new(CollectSink::new("out")))
            .build()
            .unwrap()
    };

    let err = orchestrator
        .run(build(Arc::new(StopAt {
            id: 2,
            signal: signal.clone(),
        })))
        .await
        .unwrap_err();
    let AuditflowError::Shutdown(shutdown) = err else {
        panic!("expected a shutdown error, got {err:?}");
    };
    assert_eq!(shutdown.counters.rows_processed, 2);
    assert_eq!(shutdown.counters.rows_succeeded, 2);

    let landscape = orchestrator.landscape();
    assert_eq!(
        landscape.get_run(&shutdown.run_id).unwrap().status,
        RunStatus::Interrupted
    );
    let checkpoint = landscape.get_latest_checkpoint(&shutdown.run_id).unwrap().unwrap();
    let token = landscape.get_token(&checkpoint.token_id).unwrap();
    assert_eq!(landscape.get_row(&token.row_id).unwrap().row_index, 1);

    let resumer = Orchestrator::new(Arc::clone(landscape), settings(1)).unwrap();
    let result = resumer
        .resume(
            &shutdown.run_id,
            build(Arc::new(StopAt {
                id: 0,
                signal: ShutdownSignal::new(),
            })),
        )
        .await
        .unwrap();
    assert_eq!(result.counters().rows_processed, 2);
    assert_eq!(result.status(), RunResultStatus::Completed);
}

#[tokio::test]
async fn test_resume_without_schema_fails_fast() {
    let (orchestrator, _) = orchestrator(1);
    let signal = ShutdownSignal::new();
    let orchestrator = orchestrator.with_shutdown(signal.clone());
    let pipeline = Pipeline::builder("schemaless")
        .source(Arc::new(ListSource::new("rows", rows(3))))
        .transform(Arc::new(StopAt { id: 1, signal }))
        .sink(Arc::new(CollectSink::new("out")))
        .build()
        .unwrap();
    let err = orchestrator.run(pipeline.clone()).await.unwrap_err();
    let AuditflowError::Shutdown(shutdown) = err else {
        panic!("expected a shutdown error, got {err:?}");
    };

    let err = orchestrator.resume(&shutdown.run_id, pipeline).await.unwrap_err();
    assert!(matches!(
        err,
        AuditflowError::Recovery(RecoveryError::MissingSourceSchema { .. })
    ));
}

#[tokio::test]
async fn test_resume_completed_run_is_rejected() {
    let (orchestrator, _) = orchestrator(1);
    let pipeline = Pipeline::builder("done")
        .source(Arc::new(ListSource::new("rows", rows(1)).with_schema(schema())))
        .sink(Arc::new(CollectSink::new("out")))
        .build()
        .unwrap();
    let result = orchestrator.run(pipeline.clone()).await.unwrap();

    let err = orchestrator.resume(result.run_id(), pipeline).await.unwrap_err();
    assert!(matches!(
        err,
        AuditflowError::Recovery(RecoveryError::RunNotResumable { .. })
    ));
}

#[tokio::test]
async fn test_explain_row_lineage() {
    let (orchestrator, _) = orchestrator(1);
    let pipeline = Pipeline::builder("explain")
        .source(Arc::new(ListSource::new("rows", rows(2))))
        .transform(Arc::new(MapTransform::set("tag", "status", "seen")))
        .sink(Arc::new(CollectSink::new("out")))
        .build()
        .unwrap();
    let result = orchestrator.run(pipeline).await.unwrap();

    let landscape = orchestrator.landscape();
    let row = landscape.get_rows(result.run_id()).unwrap().remove(0);
    let lineage = orchestrator
        .explain(result.run_id(), &LineageQuery::row(row.row_id.clone()))
        .unwrap();

    assert_eq!(lineage.source_row.row_id, row.row_id);
    let nodes: Vec<&str> = lineage.node_states.iter().map(|s| s.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["step0::tag", "sink::out"]);
    assert_eq!(
        lineage.outcome.map(|o| o.outcome),
        Some(RowOutcome::Completed)
    );
}

#[tokio::test]
async fn test_invalid_settings_rejected() {
    let landscape = Arc::new(Landscape::open_in_memory().unwrap());
    let settings = EngineSettings::default()
        .with_max_workers(0)
        .with_checkpoint(CheckpointSettings {
            frequency: CheckpointFrequency::EveryN(5),
            ..CheckpointSettings::default()
        });
    let err = Orchestrator::new(landscape, settings).unwrap_err();
    assert!(matches!(err, AuditflowError::Settings(_)));
}
