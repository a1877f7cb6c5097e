//! Row values.
//!
//! Plugin payloads are represented as an explicit tagged union instead of
//! loose JSON so the canonical encoder and contract inference can match
//! exhaustively on every shape a row can carry.

mod row_data;
mod row_value;

pub use row_data::RowData;
pub use row_value::{RowValue, ValueKind};
