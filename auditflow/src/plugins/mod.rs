//! Plugin interfaces consumed by the engine.
//!
//! Plugins are dispatched by role: [`Source`], [`Transform`],
//! [`BatchTransform`], [`Gate`] and [`Sink`]. The engine holds them as
//! trait objects and never inspects concrete types. Every call receives a
//! [`PluginContext`] that attributes external calls to the active node
//! state or operation.

mod context;
mod registry;
mod traits;

pub use context::PluginContext;
pub use registry::{PluginFactory, PluginRegistry};
pub use traits::{
    BatchTransform, Gate, GateDecision, Plugin, SinkWrite, Source, SourceRow, Sink, Transform,
    TransformResult,
};
