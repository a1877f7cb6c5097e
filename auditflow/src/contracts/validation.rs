//! Row validation against a contract.

use super::{ContractMode, ContractViolation, FieldViolation, SchemaContract, ViolationKind};
use crate::values::{RowData, RowValue};

/// Result of validating one row.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    /// The row keyed by normalized names, with coercions applied.
    pub row: RowData,
    /// Everything that failed. Empty means valid.
    pub violations: Vec<FieldViolation>,
}

impl ValidationOutcome {
    /// Returns true if no violations were found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

pub(super) fn validate(contract: &SchemaContract, row: &RowData, allow_coercion: bool) -> ValidationOutcome {
    let mut out = RowData::new();
    let mut violations = Vec::new();

    for field in contract.fields() {
        let value = row
            .get(&field.normalized_name)
            .or_else(|| row.get(&field.original_name));

        match value {
            None | Some(RowValue::Null) => {
                if field.required {
                    violations.push(
                        FieldViolation::new(&field.normalized_name, ViolationKind::MissingField)
                            .expected(field.field_type),
                    );
                } else if value.is_some() {
                    out.insert(field.normalized_name.clone(), RowValue::Null);
                }
            }
            Some(v) if field.field_type.accepts(v) => {
                out.insert(field.normalized_name.clone(), v.clone());
            }
            Some(v) if allow_coercion => match field.field_type.coerce(v) {
                Some(coerced) => {
                    out.insert(field.normalized_name.clone(), coerced);
                }
                None => violations.push(
                    FieldViolation::new(&field.normalized_name, ViolationKind::CoercionFailed)
                        .expected(field.field_type)
                        .actual(v.kind().to_string()),
                ),
            },
            Some(v) => violations.push(
                FieldViolation::new(&field.normalized_name, ViolationKind::TypeMismatch)
                    .expected(field.field_type)
                    .actual(v.kind().to_string()),
            ),
        }
    }

    let rejects_extras = contract.mode() == ContractMode::Fixed;
    for (name, value) in row {
        if contract.get_field(name).is_some() {
            continue;
        }
        if rejects_extras {
            violations.push(FieldViolation::new(name, ViolationKind::ExtraField).actual(value.kind().to_string()));
        } else {
            out.insert(name.clone(), value.clone());
        }
    }

    ValidationOutcome { row: out, violations }
}

/// A contract paired with its trust-boundary policy.
///
/// Sources build one with [`RowSchema::for_source`], which permits
/// coercion of external input. Every other boundary uses
/// [`RowSchema::for_pipeline`], where a mismatch is a violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSchema {
    contract: SchemaContract,
    allow_coercion: bool,
}

impl RowSchema {
    /// Schema for external input at a source.
    #[must_use]
    pub const fn for_source(contract: SchemaContract) -> Self {
        Self {
            contract,
            allow_coercion: true,
        }
    }

    /// Schema for rows already inside the pipeline.
    #[must_use]
    pub const fn for_pipeline(contract: SchemaContract) -> Self {
        Self {
            contract,
            allow_coercion: false,
        }
    }

    /// The underlying contract.
    #[must_use]
    pub const fn contract(&self) -> &SchemaContract {
        &self.contract
    }

    /// Whether coercion is permitted.
    #[must_use]
    pub const fn allow_coercion(&self) -> bool {
        self.allow_coercion
    }

    /// Validates a row under this boundary's policy.
    #[must_use]
    pub fn validate(&self, row: &RowData) -> ValidationOutcome {
        self.contract.validate(row, self.allow_coercion)
    }

    /// Validates and returns the cleaned row, or a [`ContractViolation`]
    /// attributed to `node_id`.
    ///
    /// # Errors
    ///
    /// Returns the violations if any field fails.
    pub fn check(&self, node_id: &str, row: &RowData) -> Result<RowData, ContractViolation> {
        let outcome = self.validate(row);
        if outcome.is_valid() {
            Ok(outcome.row)
        } else {
            Err(ContractViolation {
                node_id: node_id.to_string(),
                violations: outcome.violations,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{FieldContract, FieldType};
    use pretty_assertions::assert_eq;

    fn contract() -> SchemaContract {
        SchemaContract::fixed(vec![
            FieldContract::declared("Customer ID", FieldType::Int, true),
            FieldContract::declared("amount", FieldType::Float, false),
        ])
    }

    #[test]
    fn test_source_coerces_text() {
        let schema = RowSchema::for_source(contract());
        let raw = RowData::new().with("Customer ID", "42").with("amount", "9.5");
        let outcome = schema.validate(&raw);

        assert!(outcome.is_valid());
        assert_eq!(
            outcome.row,
            RowData::new().with("customer_id", 42_i64).with("amount", 9.5)
        );
    }

    #[test]
    fn test_pipeline_never_coerces() {
        let schema = RowSchema::for_pipeline(contract());
        let raw = RowData::new().with("customer_id", "42");
        let outcome = schema.validate(&raw);

        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].kind, ViolationKind::TypeMismatch);
        assert_eq!(outcome.violations[0].actual.as_deref(), Some("text"));
    }

    #[test]
    fn test_failed_coercion_reported() {
        let schema = RowSchema::for_source(contract());
        let raw = RowData::new().with("customer_id", "forty-two");
        let outcome = schema.validate(&raw);
        assert_eq!(outcome.violations[0].kind, ViolationKind::CoercionFailed);
    }

    #[test]
    fn test_missing_and_extra() {
        let schema = RowSchema::for_pipeline(contract());
        let raw = RowData::new().with("unexpected", true);
        let kinds: Vec<ViolationKind> = schema.validate(&raw).violations.into_iter().map(|v| v.kind).collect();
        assert_eq!(kinds, vec![ViolationKind::MissingField, ViolationKind::ExtraField]);
    }

    #[test]
    fn test_flexible_passes_extras_through() {
        let c = SchemaContract::flexible(vec![FieldContract::declared("id", FieldType::Int, true)]);
        let raw = RowData::new().with("id", 1_i64).with("note", "hi");
        let outcome = c.validate(&raw, false);
        assert!(outcome.is_valid());
        assert_eq!(outcome.row.get("note"), Some(&RowValue::Text("hi".into())));
    }

    #[test]
    fn test_optional_null_kept() {
        let schema = RowSchema::for_pipeline(contract());
        let raw = RowData::new().with("customer_id", 1_i64).with("amount", RowValue::Null);
        let outcome = schema.validate(&raw);
        assert!(outcome.is_valid());
        assert_eq!(outcome.row.get("amount"), Some(&RowValue::Null));
    }

    #[test]
    fn test_check_returns_violation_error() {
        let schema = RowSchema::for_pipeline(contract());
        let err = schema.check("transform::x", &RowData::new()).unwrap_err();
        assert_eq!(err.node_id, "transform::x");
    }
}
