//! The [`SchemaContract`] itself.

use super::{
    narrow_contract, ContractViolation, FieldContract, FieldSource, FieldType, ValidationOutcome,
};
use crate::canonical::sha256_hex;
use crate::values::RowData;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How strictly a contract treats fields it does not declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractMode {
    /// Exactly the declared fields. Extras are violations.
    Fixed,
    /// Declared fields plus whatever the first row adds.
    Flexible,
    /// Nothing declared; everything is learned from the first row.
    Observed,
}

impl fmt::Display for ContractMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => write!(f, "FIXED"),
            Self::Flexible => write!(f, "FLEXIBLE"),
            Self::Observed => write!(f, "OBSERVED"),
        }
    }
}

/// Immutable, versioned description of a row's fields.
///
/// Every operation that would change a contract returns a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    mode: ContractMode,
    locked: bool,
    fields: Vec<FieldContract>,
}

impl SchemaContract {
    /// A FIXED contract. Locked immediately.
    #[must_use]
    pub fn fixed(fields: Vec<FieldContract>) -> Self {
        Self {
            mode: ContractMode::Fixed,
            locked: true,
            fields,
        }
    }

    /// A FLEXIBLE contract. Locks after the first row.
    #[must_use]
    pub fn flexible(fields: Vec<FieldContract>) -> Self {
        Self {
            mode: ContractMode::Flexible,
            locked: false,
            fields,
        }
    }

    /// An OBSERVED contract with no declared fields. Locks after the
    /// first row.
    #[must_use]
    pub fn observed() -> Self {
        Self {
            mode: ContractMode::Observed,
            locked: false,
            fields: Vec::new(),
        }
    }

    /// Builds a contract from raw parts, as read back from the ledger.
    #[must_use]
    pub fn from_parts(mode: ContractMode, locked: bool, fields: Vec<FieldContract>) -> Self {
        Self {
            mode,
            locked,
            fields,
        }
    }

    /// Contract mode.
    #[must_use]
    pub const fn mode(&self) -> ContractMode {
        self.mode
    }

    /// Whether the field set is final.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    /// Fields, in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldContract] {
        &self.fields
    }

    /// Normalized field names, in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.normalized_name.as_str())
    }

    /// Looks a field up by normalized or original name.
    #[must_use]
    pub fn get_field(&self, name: &str) -> Option<&FieldContract> {
        self.fields
            .iter()
            .find(|f| f.normalized_name == name)
            .or_else(|| self.fields.iter().find(|f| f.original_name == name))
    }

    /// Returns a copy marked locked.
    #[must_use]
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    /// Content hash of the mode and field set.
    ///
    /// Field order does not affect the hash; provenance does not either,
    /// since two contracts guaranteeing the same fields are the same
    /// version.
    #[must_use]
    pub fn version_hash(&self) -> String {
        let mut parts: Vec<String> = self
            .fields
            .iter()
            .map(|f| format!("{}:{}:{}", f.normalized_name, f.field_type, f.required))
            .collect();
        parts.sort();
        sha256_hex(format!("{}|{}", self.mode, parts.join("|")).as_bytes())
    }

    /// Finalizes an unlocked contract from the first row it sees.
    ///
    /// Keys the contract does not know are added: as `inferred` for
    /// FLEXIBLE, as `observed` for OBSERVED. The result is locked. A
    /// locked contract is returned unchanged.
    #[must_use]
    pub fn finalize_with_row(&self, row: &RowData) -> Self {
        if self.locked {
            return self.clone();
        }
        let provenance = match self.mode {
            ContractMode::Observed => FieldSource::Observed,
            _ => FieldSource::Inferred,
        };
        let mut fields = self.fields.clone();
        for (name, value) in row {
            if self.get_field(name).is_some() {
                continue;
            }
            if let Some(field_type) = FieldType::infer(value) {
                fields.push(FieldContract::inferred(name, field_type, provenance));
            }
        }
        Self {
            mode: self.mode,
            locked: true,
            fields,
        }
    }

    /// Narrows this contract to the shape of a transform's output row.
    #[must_use]
    pub fn narrow(&self, output: &RowData) -> Self {
        narrow_contract(self, output)
    }

    /// Combines two branch contracts at a coalesce point.
    ///
    /// The field set is the union in first-seen order. A field present on
    /// both sides with different types widens to [`FieldType::Any`]; it is
    /// required only if both sides require it. A field on one side only is
    /// not required.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut fields: Vec<FieldContract> = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let merged = match other.get_field(&field.normalized_name) {
                Some(theirs) => FieldContract {
                    field_type: if theirs.field_type == field.field_type {
                        field.field_type
                    } else {
                        FieldType::Any
                    },
                    required: field.required && theirs.required,
                    ..field.clone()
                },
                None => FieldContract {
                    required: false,
                    ..field.clone()
                },
            };
            fields.push(merged);
        }
        for field in &other.fields {
            if self.get_field(&field.normalized_name).is_none() {
                fields.push(FieldContract {
                    required: false,
                    ..field.clone()
                });
            }
        }
        Self {
            mode: self.mode,
            locked: self.locked && other.locked,
            fields,
        }
    }

    /// Validates a row, optionally coercing values.
    ///
    /// Coercion belongs at source boundaries only; see [`super::RowSchema`].
    #[must_use]
    pub fn validate(&self, row: &RowData, allow_coercion: bool) -> ValidationOutcome {
        super::validation::validate(self, row, allow_coercion)
    }

    /// Checks a row flowing between plugins. No coercion; any violation
    /// is an upstream defect.
    ///
    /// # Errors
    ///
    /// Returns [`ContractViolation`] listing every violation found.
    pub fn verify_pipeline_row(&self, node_id: &str, row: &RowData) -> Result<(), ContractViolation> {
        let outcome = self.validate(row, false);
        if outcome.violations.is_empty() {
            Ok(())
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
    use crate::values::RowValue;
    use pretty_assertions::assert_eq;

    fn declared() -> Vec<FieldContract> {
        vec![
            FieldContract::declared("id", FieldType::Int, true),
            FieldContract::declared("Name", FieldType::Text, false),
        ]
    }

    #[test]
    fn test_fixed_is_locked() {
        assert!(SchemaContract::fixed(declared()).is_locked());
        assert!(!SchemaContract::flexible(declared()).is_locked());
    }

    #[test]
    fn test_get_field_by_either_name() {
        let c = SchemaContract::fixed(declared());
        assert_eq!(c.get_field("Name").map(|f| f.field_type), Some(FieldType::Text));
        assert_eq!(c.get_field("name").map(|f| f.field_type), Some(FieldType::Text));
        assert!(c.get_field("missing").is_none());
    }

    #[test]
    fn test_flexible_infers_first_row_then_locks() {
        let c = SchemaContract::flexible(declared());
        let row = RowData::new().with("id", 1_i64).with("score", 2.5);
        let finalized = c.finalize_with_row(&row);

        assert!(finalized.is_locked());
        let score = finalized.get_field("score").cloned();
        assert_eq!(
            score,
            Some(FieldContract::inferred("score", FieldType::Float, FieldSource::Inferred))
        );

        let second = RowData::new().with("id", 2_i64).with("late", true);
        let unchanged = finalized.finalize_with_row(&second);
        assert!(unchanged.get_field("late").is_none());
    }

    #[test]
    fn test_observed_learns_everything() {
        let row = RowData::new().with("a", 1_i64).with("b", "x");
        let c = SchemaContract::observed().finalize_with_row(&row);
        assert!(c.is_locked());
        assert_eq!(c.fields().len(), 2);
        assert!(c.fields().iter().all(|f| f.source == FieldSource::Observed));
    }

    #[test]
    fn test_version_hash_ignores_order() {
        let mut reversed = declared();
        reversed.reverse();
        let a = SchemaContract::fixed(declared());
        let b = SchemaContract::fixed(reversed);
        assert_eq!(a.version_hash(), b.version_hash());

        let c = SchemaContract::flexible(declared());
        assert_ne!(a.version_hash(), c.version_hash());
    }

    #[test]
    fn test_merge_widens_conflicts() {
        let left = SchemaContract::fixed(vec![
            FieldContract::declared("id", FieldType::Int, true),
            FieldContract::declared("v", FieldType::Int, true),
        ]);
        let right = SchemaContract::fixed(vec![
            FieldContract::declared("id", FieldType::Int, true),
            FieldContract::declared("v", FieldType::Text, true),
            FieldContract::declared("extra", FieldType::Bool, true),
        ]);
        let merged = left.merge(&right);

        let names: Vec<&str> = merged.field_names().collect();
        assert_eq!(names, vec!["id", "v", "extra"]);
        assert_eq!(merged.get_field("v").map(|f| f.field_type), Some(FieldType::Any));
        assert_eq!(merged.get_field("id").map(|f| f.required), Some(true));
        assert_eq!(merged.get_field("extra").map(|f| f.required), Some(false));
    }

    #[test]
    fn test_verify_pipeline_row_rejects_text_for_int() {
        let c = SchemaContract::fixed(declared());
        let row = RowData::new().with("id", "42");
        let err = c.verify_pipeline_row("step0", &row).unwrap_err();
        assert_eq!(err.node_id, "step0");
        assert_eq!(err.violations.len(), 1);

        let ok = RowData::new().with("id", RowValue::Int(42));
        assert!(c.verify_pipeline_row("step0", &ok).is_ok());
    }
}
