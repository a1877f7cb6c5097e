//! Logging setup and span helpers.

mod logging;

pub use logging::{init_tracing, run_span, token_span, LogFormat, SpanTimer};
