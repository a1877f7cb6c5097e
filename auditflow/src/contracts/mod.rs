//! Schema contracts.
//!
//! A [`SchemaContract`] describes the fields of a row: name, type,
//! required-ness and where the knowledge came from. Sources produce one,
//! transforms narrow it, and the ledger records it.
//!
//! Validation is asymmetric. At a source boundary external input may be
//! coerced (`"42"` → `42`); everywhere else a mismatch is an upstream bug
//! and raises a [`ContractViolation`]. The asymmetry is carried by the
//! `allow_coercion` flag on [`RowSchema`].

mod errors;
mod field;
mod naming;
mod propagation;
mod schema;
mod validation;

pub use errors::{ContractViolation, FieldViolation, ViolationKind};
pub use field::{FieldContract, FieldSource, FieldType};
pub use naming::normalize_field_name;
pub use propagation::narrow_contract;
pub use schema::{ContractMode, SchemaContract};
pub use validation::{RowSchema, ValidationOutcome};
