//! Mock plugins for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::contracts::SchemaContract;
use crate::errors::PluginError;
use crate::landscape::Determinism;
use crate::plugins::{
    BatchTransform, Gate, GateDecision, Plugin, PluginContext, Sink, SinkWrite, Source, SourceRow,
    Transform, TransformResult,
};
use crate::values::{RowData, RowValue};

/// A source that yields a fixed list of rows.
#[derive(Debug)]
pub struct ListSource {
    name: String,
    rows: Vec<SourceRow>,
    schema: Option<SchemaContract>,
    on_validation_failure: String,
}

impl ListSource {
    /// Creates a source over valid rows, with no declared schema.
    #[must_use]
    pub fn new(name: impl Into<String>, rows: Vec<RowData>) -> Self {
        Self {
            name: name.into(),
            rows: rows.into_iter().map(SourceRow::Valid).collect(),
            schema: None,
            on_validation_failure: "discard".to_string(),
        }
    }

    /// Declares a schema.
    #[must_use]
    pub fn with_schema(mut self, schema: SchemaContract) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Sets where invalid rows go.
    #[must_use]
    pub fn with_validation_failure(mut self, destination: impl Into<String>) -> Self {
        self.on_validation_failure = destination.into();
        self
    }

    /// Appends a row the source itself rejected.
    #[must_use]
    pub fn with_quarantined(mut self, raw: impl Into<RowValue>, reason: impl Into<String>) -> Self {
        self.rows.push(SourceRow::Quarantined {
            raw: raw.into(),
            reason: reason.into(),
        });
        self
    }
}

#[async_trait]
impl Plugin for ListSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn determinism(&self) -> Determinism {
        Determinism::IoRead
    }
}

#[async_trait]
impl Source for ListSource {
    fn schema(&self) -> Option<SchemaContract> {
        self.schema.clone()
    }

    fn on_validation_failure(&self) -> &str {
        &self.on_validation_failure
    }

    async fn load(&self, _ctx: &PluginContext) -> Result<Vec<SourceRow>, PluginError> {
        Ok(self.rows.clone())
    }
}

#[derive(Debug, Clone)]
enum MapOp {
    Identity,
    Uppercase(String),
    Set(String, RowValue),
    Explode(String),
}

/// A deterministic row-to-row transform.
#[derive(Debug)]
pub struct MapTransform {
    name: String,
    op: MapOp,
    determinism: Determinism,
    calls: AtomicU32,
}

impl MapTransform {
    fn with_op(name: impl Into<String>, op: MapOp) -> Self {
        Self {
            name: name.into(),
            op,
            determinism: Determinism::Deterministic,
            calls: AtomicU32::new(0),
        }
    }

    /// Passes rows through unchanged.
    #[must_use]
    pub fn identity(name: impl Into<String>) -> Self {
        Self::with_op(name, MapOp::Identity)
    }

    /// Uppercases a text field.
    #[must_use]
    pub fn uppercase(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_op(name, MapOp::Uppercase(field.into()))
    }

    /// Sets a field to a constant.
    #[must_use]
    pub fn set(name: impl Into<String>, field: impl Into<String>, value: impl Into<RowValue>) -> Self {
        Self::with_op(name, MapOp::Set(field.into(), value.into()))
    }

    /// Emits one row per element of an array field, with the element
    /// under `item`.
    #[must_use]
    pub fn explode(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_op(name, MapOp::Explode(field.into()))
    }

    /// Overrides the determinism class.
    #[must_use]
    pub fn with_determinism(mut self, determinism: Determinism) -> Self {
        self.determinism = determinism;
        self
    }

    /// Number of rows processed.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for MapTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn determinism(&self) -> Determinism {
        self.determinism
    }

    fn config(&self) -> Value {
        json!({ "op": format!("{:?}", self.op) })
    }
}

#[async_trait]
impl Transform for MapTransform {
    async fn process(&self, row: &RowData, _ctx: &PluginContext) -> TransformResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.op {
            MapOp::Identity => TransformResult::Success(row.clone()),
            MapOp::Uppercase(field) => {
                let mut out = row.clone();
                if let Some(text) = row.get(field).and_then(RowValue::as_str) {
                    out.insert(field.clone(), text.to_uppercase());
                }
                TransformResult::Success(out)
            }
            MapOp::Set(field, value) => TransformResult::Success(row.clone().with(field.clone(), value.clone())),
            MapOp::Explode(field) => match row.get(field) {
                Some(RowValue::Array(items)) => TransformResult::Multi(
                    items
                        .iter()
                        .map(|item| row.clone().with("item", item.clone()))
                        .collect(),
                ),
                _ => TransformResult::error(format!("field '{field}' is not an array")),
            },
        }
    }
}

/// Fails with a retryable error a set number of times, then passes rows
/// through.
#[derive(Debug)]
pub struct FlakyTransform {
    name: String,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyTransform {
    /// Creates a transform that fails its first `failures` calls.
    #[must_use]
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            failures,
            calls: AtomicU32::new(0),
        }
    }

    /// Number of calls made.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for FlakyTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn determinism(&self) -> Determinism {
        Determinism::ExternalCall
    }
}

#[async_trait]
impl Transform for FlakyTransform {
    async fn process(&self, row: &RowData, _ctx: &PluginContext) -> TransformResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            TransformResult::transient(format!("attempt {call} timed out"))
        } else {
            TransformResult::Success(row.clone())
        }
    }
}

/// Fails every row, or only rows whose field equals a value.
#[derive(Debug)]
pub struct FailingTransform {
    name: String,
    message: String,
    retryable: bool,
    only_when: Option<(String, RowValue)>,
}

impl FailingTransform {
    /// Fails every row with a non-retryable error.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            retryable: false,
            only_when: None,
        }
    }

    /// Fails every row with a retryable error.
    #[must_use]
    pub fn retryable(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(name, message)
        }
    }

    /// Limits failures to rows where `field` equals `value`.
    #[must_use]
    pub fn when_equals(mut self, field: impl Into<String>, value: impl Into<RowValue>) -> Self {
        self.only_when = Some((field.into(), value.into()));
        self
    }
}

#[async_trait]
impl Plugin for FailingTransform {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transform for FailingTransform {
    async fn process(&self, row: &RowData, _ctx: &PluginContext) -> TransformResult {
        let applies = self
            .only_when
            .as_ref()
            .map_or(true, |(field, value)| row.get(field) == Some(value));
        if !applies {
            return TransformResult::Success(row.clone());
        }
        if self.retryable {
            TransformResult::transient(self.message.clone())
        } else {
            TransformResult::error(self.message.clone())
        }
    }
}

#[derive(Debug, Clone)]
enum GateRule {
    RouteWhenEquals {
        field: String,
        value: RowValue,
        label: String,
    },
    Fork(Vec<String>),
}

/// A gate driven by a fixed rule.
#[derive(Debug)]
pub struct FieldGate {
    name: String,
    rule: GateRule,
}

impl FieldGate {
    /// Routes rows whose `field` equals `value` through `label`; others
    /// continue.
    #[must_use]
    pub fn route_when_equals(
        name: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<RowValue>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            rule: GateRule::RouteWhenEquals {
                field: field.into(),
                value: value.into(),
                label: label.into(),
            },
        }
    }

    /// Forks every row onto `branches`.
    #[must_use]
    pub fn fork(name: impl Into<String>, branches: &[&str]) -> Self {
        Self {
            name: name.into(),
            rule: GateRule::Fork(branches.iter().map(|b| (*b).to_string()).collect()),
        }
    }
}

#[async_trait]
impl Plugin for FieldGate {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Gate for FieldGate {
    async fn evaluate(&self, row: &RowData, _ctx: &PluginContext) -> Result<GateDecision, PluginError> {
        Ok(match &self.rule {
            GateRule::RouteWhenEquals {
                field,
                value,
                label,
            } if row.get(field) == Some(value) => GateDecision::Route(label.clone()),
            GateRule::RouteWhenEquals { .. } => GateDecision::Continue,
            GateRule::Fork(branches) => GateDecision::Fork(branches.clone()),
        })
    }
}

/// Collapses a batch into `{"sum": .., "count": ..}` over an integer
/// field.
#[derive(Debug)]
pub struct SumBatch {
    name: String,
    field: String,
}

impl SumBatch {
    /// Creates a batch transform summing `field`.
    #[must_use]
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
        }
    }
}

#[async_trait]
impl Plugin for SumBatch {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl BatchTransform for SumBatch {
    async fn process_batch(&self, rows: &[RowData], _ctx: &PluginContext) -> TransformResult {
        let sum: i64 = rows
            .iter()
            .filter_map(|row| row.get(&self.field).and_then(RowValue::as_i64))
            .sum();
        let count = i64::try_from(rows.len()).unwrap_or(i64::MAX);
        TransformResult::Success(RowData::new().with("sum", sum).with("count", count))
    }
}

/// A sink that keeps written rows in memory.
#[derive(Debug)]
pub struct CollectSink {
    name: String,
    rows: Mutex<Vec<RowData>>,
}

impl CollectSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Mutex::new(Vec::new()),
        }
    }

    /// Rows written so far.
    #[must_use]
    pub fn rows(&self) -> Vec<RowData> {
        self.rows.lock().clone()
    }

    /// Number of rows written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl Plugin for CollectSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn determinism(&self) -> Determinism {
        Determinism::IoWrite
    }
}

#[async_trait]
impl Sink for CollectSink {
    async fn write(&self, rows: &[RowData], _ctx: &PluginContext) -> Result<SinkWrite, PluginError> {
        let mut stored = self.rows.lock();
        stored.extend_from_slice(rows);
        Ok(SinkWrite::Completed(json!({ "rows": rows.len(), "total": stored.len() })))
    }
}

/// A sink that accepts a number of writes and then fails.
#[derive(Debug)]
pub struct FailingSink {
    name: String,
    message: String,
    succeed_first: u32,
    writes: AtomicU32,
}

impl FailingSink {
    /// Fails every write.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            succeed_first: 0,
            writes: AtomicU32::new(0),
        }
    }

    /// Lets the first `count` writes succeed.
    #[must_use]
    pub const fn after(mut self, count: u32) -> Self {
        self.succeed_first = count;
        self
    }
}

#[async_trait]
impl Plugin for FailingSink {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Sink for FailingSink {
    async fn write(&self, rows: &[RowData], _ctx: &PluginContext) -> Result<SinkWrite, PluginError> {
        let write = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if write <= self.succeed_first {
            Ok(SinkWrite::Completed(json!({ "rows": rows.len() })))
        } else {
            Err(PluginError::new(&self.name, self.message.clone()))
        }
    }
}

/// A sink whose writes are always submitted but never confirmed.
#[derive(Debug)]
pub struct PendingSink {
    name: String,
}

impl PendingSink {
    /// Creates the sink.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Plugin for PendingSink {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Sink for PendingSink {
    async fn write(&self, _rows: &[RowData], _ctx: &PluginContext) -> Result<SinkWrite, PluginError> {
        Ok(SinkWrite::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landscape::Landscape;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn ctx() -> PluginContext {
        PluginContext::new(Arc::new(Landscape::open_in_memory().unwrap()), "run", "node")
    }

    #[tokio::test]
    async fn test_uppercase_transform() {
        let transform = MapTransform::uppercase("upper", "name");
        let result = transform
            .process(&RowData::new().with("name", "ada"), &ctx())
            .await;
        assert_eq!(
            result,
            TransformResult::Success(RowData::new().with("name", "ADA"))
        );
        assert_eq!(transform.call_count(), 1);
    }

    #[tokio::test]
    async fn test_explode_transform() {
        let transform = MapTransform::explode("split", "tags");
        let row = RowData::new().with("tags", RowValue::Array(vec!["a".into(), "b".into()]));
        let TransformResult::Multi(rows) = transform.process(&row, &ctx()).await else {
            panic!("expected multiple rows");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("item"), Some(&RowValue::from("b")));
    }

    #[tokio::test]
    async fn test_flaky_transform_recovers() {
        let transform = FlakyTransform::new("flaky", 1);
        let row = RowData::new();
        assert!(matches!(
            transform.process(&row, &ctx()).await,
            TransformResult::Error { retryable: true, .. }
        ));
        assert!(matches!(
            transform.process(&row, &ctx()).await,
            TransformResult::Success(_)
        ));
    }

    #[tokio::test]
    async fn test_failing_transform_filter() {
        let transform = FailingTransform::new("bad", "no").when_equals("id", 2);
        let ok = transform.process(&RowData::new().with("id", 1), &ctx()).await;
        let failed = transform.process(&RowData::new().with("id", 2), &ctx()).await;
        assert!(matches!(ok, TransformResult::Success(_)));
        assert_eq!(failed, TransformResult::error("no"));
    }

    #[tokio::test]
    async fn test_failing_sink_after() {
        let sink = FailingSink::new("out", "disk full").after(1);
        let rows = [RowData::new()];
        assert!(sink.write(&rows, &ctx()).await.is_ok());
        let err = sink.write(&rows, &ctx()).await.unwrap_err();
        assert_eq!(err.message, "disk full");
    }

    #[tokio::test]
    async fn test_sum_batch() {
        let batch = SumBatch::new("sum", "n");
        let rows = [RowData::new().with("n", 2), RowData::new().with("n", 5)];
        let result = batch.process_batch(&rows, &ctx()).await;
        assert_eq!(
            result,
            TransformResult::Success(RowData::new().with("sum", 7_i64).with("count", 2_i64))
        );
    }
}
