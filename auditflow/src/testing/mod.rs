//! Testing utilities for auditflow pipelines.
//!
//! Mock plugins for every role, with constructors that make a scenario
//! readable in one line.

mod mocks;

pub use mocks::{
    CollectSink, FailingSink, FailingTransform, FieldGate, FlakyTransform, ListSource,
    MapTransform, PendingSink, SumBatch,
};
