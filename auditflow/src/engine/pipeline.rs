//! Pipeline definition and builder.

use crate::errors::{AuditflowError, PluginError};
use crate::landscape::{Determinism, NodeRegistration, NodeType, RoutingMode};
use crate::plugins::{BatchTransform, Gate, PluginContext, Sink, Source, Transform};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Destination that records a failure without writing the row anywhere.
pub const DISCARD: &str = "discard";

/// Edge label for the normal path between consecutive nodes.
pub const CONTINUE_LABEL: &str = "continue";

/// Edge label from a step to its `on_error` sink.
pub const ON_ERROR_LABEL: &str = "on_error";

/// Edge label from the source to its quarantine sink.
pub const QUARANTINE_LABEL: &str = "quarantine";

/// How a coalesce step merges branch rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// One flat row. Later branches, in declaration order, win on key
    /// collisions.
    #[default]
    Union,
    /// `{branch: row}` for each branch.
    Nested,
}

/// One step between the source and the sinks.
#[derive(Debug, Clone)]
pub enum Step {
    /// Row-at-a-time transform.
    Transform {
        /// Plugin.
        plugin: Arc<dyn Transform>,
        /// Failure destination: a sink, [`DISCARD`], or none to fail the
        /// token.
        on_error: Option<String>,
        /// Only tokens on this fork branch are processed; others pass.
        branch: Option<String>,
    },
    /// Routing decision.
    Gate {
        /// Plugin.
        plugin: Arc<dyn Gate>,
        /// Route label to sink name.
        routes: BTreeMap<String, String>,
        /// Branch names the gate may fork into.
        branches: Vec<String>,
        /// Only tokens on this fork branch are evaluated; others pass.
        branch: Option<String>,
    },
    /// Count-triggered batch transform.
    Aggregation {
        /// Plugin.
        plugin: Arc<dyn BatchTransform>,
        /// Buffered tokens that trigger a flush.
        trigger_count: usize,
        /// Failure destination, as for transforms.
        on_error: Option<String>,
    },
    /// Joins the branches of one fork.
    Coalesce {
        /// Step name.
        name: String,
        /// Branches that must all arrive.
        branches: Vec<String>,
        /// Merge policy.
        policy: MergePolicy,
    },
}

impl Step {
    /// Step name, used in its node id.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Transform { plugin, .. } => plugin.name(),
            Self::Gate { plugin, .. } => plugin.name(),
            Self::Aggregation { plugin, .. } => plugin.name(),
            Self::Coalesce { name, .. } => name,
        }
    }

    fn node_type(&self) -> NodeType {
        match self {
            Self::Transform { .. } => NodeType::Transform,
            Self::Gate { .. } => NodeType::Gate,
            Self::Aggregation { .. } => NodeType::Aggregation,
            Self::Coalesce { .. } => NodeType::Coalesce,
        }
    }

    fn registration(&self, node_id: String) -> NodeRegistration {
        let (version, determinism, config) = match self {
            Self::Transform { plugin, .. } => {
                (plugin.version(), plugin.determinism(), plugin.config())
            }
            Self::Gate { plugin, .. } => (plugin.version(), plugin.determinism(), plugin.config()),
            Self::Aggregation {
                plugin,
                trigger_count,
                ..
            } => (
                plugin.version(),
                plugin.determinism(),
                json!({ "plugin": plugin.config(), "trigger_count": trigger_count }),
            ),
            Self::Coalesce {
                branches, policy, ..
            } => (
                "0.0.0",
                Determinism::Deterministic,
                json!({ "branches": branches, "policy": policy }),
            ),
        };
        NodeRegistration::new(node_id, self.name(), self.node_type(), determinism)
            .with_version(version)
            .with_config(config)
    }

    fn on_error(&self) -> Option<&str> {
        match self {
            Self::Transform { on_error, .. } | Self::Aggregation { on_error, .. } => {
                on_error.as_deref()
            }
            _ => None,
        }
    }
}

/// An edge to register at run start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeSpec {
    /// Upstream node.
    pub from: String,
    /// Downstream node.
    pub to: String,
    /// Label, unique per upstream node.
    pub label: String,
    /// Move or copy.
    pub mode: RoutingMode,
}

/// A plugin of any role, for lifecycle hooks.
#[derive(Debug, Clone)]
pub enum PluginHandle {
    /// Source.
    Source(Arc<dyn Source>),
    /// Transform.
    Transform(Arc<dyn Transform>),
    /// Batch transform.
    Batch(Arc<dyn BatchTransform>),
    /// Gate.
    Gate(Arc<dyn Gate>),
    /// Sink.
    Sink(Arc<dyn Sink>),
}

impl PluginHandle {
    /// Runs `on_start`.
    ///
    /// # Errors
    ///
    /// Returns the plugin's error.
    pub async fn on_start(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        match self {
            Self::Source(p) => p.on_start(ctx).await,
            Self::Transform(p) => p.on_start(ctx).await,
            Self::Batch(p) => p.on_start(ctx).await,
            Self::Gate(p) => p.on_start(ctx).await,
            Self::Sink(p) => p.on_start(ctx).await,
        }
    }

    /// Runs `on_complete`.
    ///
    /// # Errors
    ///
    /// Returns the plugin's error.
    pub async fn on_complete(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        match self {
            Self::Source(p) => p.on_complete(ctx).await,
            Self::Transform(p) => p.on_complete(ctx).await,
            Self::Batch(p) => p.on_complete(ctx).await,
            Self::Gate(p) => p.on_complete(ctx).await,
            Self::Sink(p) => p.on_complete(ctx).await,
        }
    }

    /// Runs `close`.
    ///
    /// # Errors
    ///
    /// Returns the plugin's error.
    pub async fn close(&self) -> Result<(), PluginError> {
        match self {
            Self::Source(p) => p.close().await,
            Self::Transform(p) => p.close().await,
            Self::Batch(p) => p.close().await,
            Self::Gate(p) => p.close().await,
            Self::Sink(p) => p.close().await,
        }
    }
}

/// A validated pipeline: one source, ordered steps, named sinks.
///
/// Node ids are deterministic: `source::{name}`, `step{index}::{name}`
/// and `sink::{name}`, so a resumed run finds the nodes it registered.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    source: Arc<dyn Source>,
    steps: Vec<Step>,
    sinks: Vec<(String, Arc<dyn Sink>)>,
    default_sink: String,
}

impl Pipeline {
    /// Starts a builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The source.
    #[must_use]
    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    /// Steps in order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// A sink by name.
    #[must_use]
    pub fn sink(&self, name: &str) -> Option<&Arc<dyn Sink>> {
        self.sinks.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Where tokens that pass every step go.
    #[must_use]
    pub fn default_sink(&self) -> &str {
        &self.default_sink
    }

    /// Source node id.
    #[must_use]
    pub fn source_node_id(&self) -> String {
        format!("source::{}", self.source.name())
    }

    /// Node id of step `index`.
    #[must_use]
    pub fn step_node_id(&self, index: usize) -> String {
        self.steps
            .get(index)
            .map_or_else(String::new, |step| format!("step{index}::{}", step.name()))
    }

    /// Node id of a sink.
    #[must_use]
    pub fn sink_node_id(&self, name: &str) -> String {
        format!("sink::{name}")
    }

    /// Registration sequence of step `index`.
    #[must_use]
    pub fn step_sequence(&self, index: usize) -> i64 {
        to_i64(index + 1)
    }

    /// Registration sequence of a sink.
    #[must_use]
    pub fn sink_sequence(&self, name: &str) -> i64 {
        let position = self
            .sinks
            .iter()
            .position(|(n, _)| n == name)
            .unwrap_or(self.sinks.len());
        to_i64(self.steps.len() + 1 + position)
    }

    fn next_node_id(&self, index: usize) -> String {
        if index < self.steps.len() {
            self.step_node_id(index)
        } else {
            self.sink_node_id(&self.default_sink)
        }
    }

    /// Every node to register, in sequence order.
    #[must_use]
    pub fn node_registrations(&self) -> Vec<NodeRegistration> {
        let mut nodes = Vec::with_capacity(self.steps.len() + self.sinks.len() + 1);
        let source_config = json!({
            "plugin": self.source.config(),
            "on_validation_failure": self.source.on_validation_failure(),
        });
        let mut source = NodeRegistration::new(
            self.source_node_id(),
            self.source.name(),
            NodeType::Source,
            self.source.determinism(),
        )
        .with_version(self.source.version())
        .with_config(source_config)
        .with_sequence(0);
        if let Some(schema) = self.source.schema() {
            if let Ok(schema_json) = serde_json::to_value(&schema) {
                source = source.with_schema(schema_json);
            }
        }
        nodes.push(source);

        for (index, step) in self.steps.iter().enumerate() {
            nodes.push(
                step.registration(self.step_node_id(index))
                    .with_sequence(self.step_sequence(index)),
            );
        }
        for (name, sink) in &self.sinks {
            nodes.push(
                NodeRegistration::new(
                    self.sink_node_id(name),
                    sink.name(),
                    NodeType::Sink,
                    sink.determinism(),
                )
                .with_version(sink.version())
                .with_config(sink.config())
                .with_sequence(self.sink_sequence(name)),
            );
        }
        nodes
    }

    /// Every edge to register.
    #[must_use]
    pub fn edges(&self) -> Vec<EdgeSpec> {
        let edge = |from: String, to: String, label: &str, mode: RoutingMode| EdgeSpec {
            from,
            to,
            label: label.to_string(),
            mode,
        };
        let mut edges = vec![edge(
            self.source_node_id(),
            self.next_node_id(0),
            CONTINUE_LABEL,
            RoutingMode::Move,
        )];
        let quarantine = self.source.on_validation_failure();
        if quarantine != DISCARD {
            edges.push(edge(
                self.source_node_id(),
                self.sink_node_id(quarantine),
                QUARANTINE_LABEL,
                RoutingMode::Move,
            ));
        }

        for (index, step) in self.steps.iter().enumerate() {
            let from = self.step_node_id(index);
            let next = self.next_node_id(index + 1);
            edges.push(edge(from.clone(), next.clone(), CONTINUE_LABEL, RoutingMode::Move));
            if let Step::Gate {
                routes, branches, ..
            } = step
            {
                for (label, sink) in routes {
                    edges.push(edge(from.clone(), self.sink_node_id(sink), label, RoutingMode::Move));
                }
                for branch in branches {
                    edges.push(edge(from.clone(), next.clone(), branch, RoutingMode::Copy));
                }
            }
            if let Some(dest) = step.on_error().filter(|d| *d != DISCARD) {
                edges.push(edge(from, self.sink_node_id(dest), ON_ERROR_LABEL, RoutingMode::Move));
            }
        }
        edges
    }

    /// Every plugin with its node id, source first.
    #[must_use]
    pub fn plugins(&self) -> Vec<(String, PluginHandle)> {
        let mut plugins = vec![(
            self.source_node_id(),
            PluginHandle::Source(Arc::clone(&self.source)),
        )];
        for (index, step) in self.steps.iter().enumerate() {
            let handle = match step {
                Step::Transform { plugin, .. } => PluginHandle::Transform(Arc::clone(plugin)),
                Step::Gate { plugin, .. } => PluginHandle::Gate(Arc::clone(plugin)),
                Step::Aggregation { plugin, .. } => PluginHandle::Batch(Arc::clone(plugin)),
                Step::Coalesce { .. } => continue,
            };
            plugins.push((self.step_node_id(index), handle));
        }
        for (name, sink) in &self.sinks {
            plugins.push((self.sink_node_id(name), PluginHandle::Sink(Arc::clone(sink))));
        }
        plugins
    }

    /// A JSON description for the run's settings snapshot.
    #[must_use]
    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "source": self.source_node_id(),
            "steps": (0..self.steps.len()).map(|i| self.step_node_id(i)).collect::<Vec<_>>(),
            "sinks": self.sinks.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>(),
            "default_sink": self.default_sink,
        })
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Builds a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    source: Option<Arc<dyn Source>>,
    steps: Vec<Step>,
    sinks: Vec<(String, Arc<dyn Sink>)>,
    default_sink: Option<String>,
}

impl PipelineBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            steps: Vec::new(),
            sinks: Vec::new(),
            default_sink: None,
        }
    }

    /// Sets the source.
    #[must_use]
    pub fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    /// Appends a transform whose failures fail the token.
    #[must_use]
    pub fn transform(self, plugin: Arc<dyn Transform>) -> Self {
        self.step(Step::Transform {
            plugin,
            on_error: None,
            branch: None,
        })
    }

    /// Appends a transform whose failures go to `destination`.
    #[must_use]
    pub fn transform_on_error(self, plugin: Arc<dyn Transform>, destination: &str) -> Self {
        self.step(Step::Transform {
            plugin,
            on_error: Some(destination.to_string()),
            branch: None,
        })
    }

    /// Appends a transform that only processes tokens on `branch`.
    #[must_use]
    pub fn branch_transform(self, branch: &str, plugin: Arc<dyn Transform>) -> Self {
        self.step(Step::Transform {
            plugin,
            on_error: None,
            branch: Some(branch.to_string()),
        })
    }

    /// Appends a gate with route labels mapped to sinks and the branches
    /// it may fork into.
    #[must_use]
    pub fn gate(self, plugin: Arc<dyn Gate>, routes: &[(&str, &str)], branches: &[&str]) -> Self {
        self.step(Step::Gate {
            plugin,
            routes: routes
                .iter()
                .map(|(label, sink)| ((*label).to_string(), (*sink).to_string()))
                .collect(),
            branches: branches.iter().map(|b| (*b).to_string()).collect(),
            branch: None,
        })
    }

    /// Appends a count-triggered aggregation.
    #[must_use]
    pub fn aggregation(
        self,
        plugin: Arc<dyn BatchTransform>,
        trigger_count: usize,
        on_error: Option<&str>,
    ) -> Self {
        self.step(Step::Aggregation {
            plugin,
            trigger_count,
            on_error: on_error.map(str::to_string),
        })
    }

    /// Appends a coalesce over `branches`.
    #[must_use]
    pub fn coalesce(self, name: &str, branches: &[&str], policy: MergePolicy) -> Self {
        self.step(Step::Coalesce {
            name: name.to_string(),
            branches: branches.iter().map(|b| (*b).to_string()).collect(),
            policy,
        })
    }

    /// Appends any step.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a sink under its plugin name. The first sink is the default
    /// unless [`PipelineBuilder::default_sink`] says otherwise.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push((sink.name().to_string(), sink));
        self
    }

    /// Names the default sink.
    #[must_use]
    pub fn default_sink(mut self, name: &str) -> Self {
        self.default_sink = Some(name.to_string());
        self
    }

    /// Validates and builds.
    ///
    /// # Errors
    ///
    /// Returns [`AuditflowError::Pipeline`] for a missing source or sink,
    /// duplicate sink names, an unknown destination, a zero trigger
    /// count, or an empty or duplicated branch list.
    pub fn build(self) -> Result<Pipeline, AuditflowError> {
        let source = self
            .source
            .ok_or_else(|| AuditflowError::pipeline("pipeline has no source"))?;
        let mut sink_names = HashSet::new();
        for (name, _) in &self.sinks {
            if !sink_names.insert(name.as_str()) {
                return Err(AuditflowError::pipeline(format!("duplicate sink '{name}'")));
            }
        }
        let default_sink = match self.default_sink {
            Some(name) => name,
            None => self
                .sinks
                .first()
                .map(|(name, _)| name.clone())
                .ok_or_else(|| AuditflowError::pipeline("pipeline has no sink"))?,
        };
        let known = |dest: &str| dest == DISCARD || sink_names.contains(dest);
        if !sink_names.contains(default_sink.as_str()) {
            return Err(AuditflowError::pipeline(format!(
                "default sink '{default_sink}' is not defined"
            )));
        }
        if !known(source.on_validation_failure()) {
            return Err(AuditflowError::pipeline(format!(
                "source quarantine destination '{}' is not a sink",
                source.on_validation_failure()
            )));
        }

        for step in &self.steps {
            if let Some(dest) = step.on_error() {
                if !known(dest) {
                    return Err(AuditflowError::pipeline(format!(
                        "step '{}' sends errors to unknown destination '{dest}'",
                        step.name()
                    )));
                }
            }
            match step {
                Step::Gate {
                    routes, branches, ..
                } => {
                    let mut labels = HashSet::from([CONTINUE_LABEL, ON_ERROR_LABEL]);
                    for (label, sink) in routes {
                        if !sink_names.contains(sink.as_str()) {
                            return Err(AuditflowError::pipeline(format!(
                                "gate '{}' routes '{label}' to unknown sink '{sink}'",
                                step.name()
                            )));
                        }
                        if !labels.insert(label.as_str()) {
                            return Err(AuditflowError::pipeline(format!(
                                "gate '{}' reuses label '{label}'",
                                step.name()
                            )));
                        }
                    }
                    for branch in branches {
                        if !labels.insert(branch.as_str()) {
                            return Err(AuditflowError::pipeline(format!(
                                "gate '{}' reuses label '{branch}'",
                                step.name()
                            )));
                        }
                    }
                }
                Step::Aggregation { trigger_count, .. } if *trigger_count == 0 => {
                    return Err(AuditflowError::pipeline(format!(
                        "aggregation '{}' needs a trigger count of at least 1",
                        step.name()
                    )));
                }
                Step::Coalesce { branches, .. } => {
                    let unique: HashSet<&String> = branches.iter().collect();
                    if branches.is_empty() || unique.len() != branches.len() {
                        return Err(AuditflowError::pipeline(format!(
                            "coalesce '{}' needs distinct branches",
                            step.name()
                        )));
                    }
                }
                _ => {}
            }
        }

        Ok(Pipeline {
            name: self.name,
            source,
            steps: self.steps,
            sinks: self.sinks,
            default_sink,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CollectSink, FieldGate, ListSource, MapTransform};
    use crate::values::RowData;
    use pretty_assertions::assert_eq;

    fn source() -> Arc<dyn Source> {
        Arc::new(ListSource::new("rows", vec![RowData::new().with("id", 1)]))
    }

    #[test]
    fn test_node_ids_and_sequences() {
        let pipeline = Pipeline::builder("p")
            .source(source())
            .transform(Arc::new(MapTransform::identity("clean")))
            .sink(Arc::new(CollectSink::new("out")))
            .sink(Arc::new(CollectSink::new("review")))
            .build()
            .unwrap();

        let nodes = pipeline.node_registrations();
        let ids: Vec<_> = nodes.iter().map(|n| n.node_id.clone()).collect();
        assert_eq!(
            ids,
            vec!["source::rows", "step0::clean", "sink::out", "sink::review"]
        );
        let sequences: Vec<_> = nodes.iter().map(|n| n.sequence).collect();
        assert_eq!(sequences, vec![Some(0), Some(1), Some(2), Some(3)]);
        assert_eq!(pipeline.default_sink(), "out");
    }

    #[test]
    fn test_gate_edges() {
        let pipeline = Pipeline::builder("p")
            .source(source())
            .gate(
                Arc::new(FieldGate::route_when_equals("check", "id", 1, "flagged")),
                &[("flagged", "review")],
                &["left", "right"],
            )
            .sink(Arc::new(CollectSink::new("out")))
            .sink(Arc::new(CollectSink::new("review")))
            .build()
            .unwrap();

        let labels: Vec<_> = pipeline
            .edges()
            .into_iter()
            .filter(|e| e.from == "step0::check")
            .map(|e| (e.label, e.to, e.mode))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("continue".to_string(), "sink::out".to_string(), RoutingMode::Move),
                ("flagged".to_string(), "sink::review".to_string(), RoutingMode::Move),
                ("left".to_string(), "sink::out".to_string(), RoutingMode::Copy),
                ("right".to_string(), "sink::out".to_string(), RoutingMode::Copy),
            ]
        );
    }

    #[test]
    fn test_build_rejects_unknown_destinations() {
        let err = Pipeline::builder("p")
            .source(source())
            .transform_on_error(Arc::new(MapTransform::identity("t")), "nowhere")
            .sink(Arc::new(CollectSink::new("out")))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown destination 'nowhere'"));

        let err = Pipeline::builder("p")
            .source(source())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no sink"));
    }

    #[test]
    fn test_build_rejects_bad_coalesce() {
        let err = Pipeline::builder("p")
            .source(source())
            .coalesce("join", &["a", "a"], MergePolicy::Union)
            .sink(Arc::new(CollectSink::new("out")))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("distinct branches"));
    }
}
