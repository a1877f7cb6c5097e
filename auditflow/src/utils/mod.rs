//! Identifier and timestamp helpers shared by the ledger and the engine.

pub mod ids;
pub mod timestamps;

pub use ids::{generate_id, generate_time_ordered_id};
pub use timestamps::{
    format_iso8601, format_iso8601_exact, now_utc, parse_date, parse_timestamp, Timestamp,
    TimestampError,
};
