//! Contract narrowing across transform boundaries.

use super::{FieldContract, FieldSource, FieldType, SchemaContract};
use crate::values::RowData;
use std::collections::HashSet;

/// Produces the contract for a transform's output row.
///
/// The result's field set is exactly the output row's keys. Fields the
/// input already described keep their type, required flag and
/// provenance. New fields are added as `inferred`, not required, with a
/// type guessed from the value; keys whose values cannot be inferred
/// (non-finite floats) are left out. Mode and lock state carry over.
/// A field reachable through both its original and normalized key
/// appears once.
///
/// Never fails.
#[must_use]
pub fn narrow_contract(input: &SchemaContract, output: &RowData) -> SchemaContract {
    let mut seen = HashSet::new();
    let fields = output
        .iter()
        .filter_map(|(name, value)| match input.get_field(name) {
            Some(existing) => Some(existing.clone()),
            None => FieldType::infer(value)
                .map(|ty| FieldContract::inferred(name, ty, FieldSource::Inferred)),
        })
        .filter(|field| seen.insert(field.normalized_name.clone()))
        .collect();

    SchemaContract::from_parts(input.mode(), input.is_locked(), fields)
}
