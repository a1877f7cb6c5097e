//! Contract violation types.

use super::FieldType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// What went wrong with a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A required field is absent.
    MissingField,
    /// The value's type does not match the declared type.
    TypeMismatch,
    /// A FIXED contract received a field it does not declare.
    ExtraField,
    /// Coercion was permitted but the text could not be converted.
    CoercionFailed,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField => write!(f, "missing_field"),
            Self::TypeMismatch => write!(f, "type_mismatch"),
            Self::ExtraField => write!(f, "extra_field"),
            Self::CoercionFailed => write!(f, "coercion_failed"),
        }
    }
}

/// One field-level contract violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// Normalized field name.
    pub field: String,
    /// Violation classification.
    pub kind: ViolationKind,
    /// Declared type, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<FieldType>,
    /// Observed value kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl FieldViolation {
    /// Creates a violation.
    #[must_use]
    pub fn new(field: impl Into<String>, kind: ViolationKind) -> Self {
        Self {
            field: field.into(),
            kind,
            expected: None,
            actual: None,
        }
    }

    /// Sets the expected type.
    #[must_use]
    pub fn expected(mut self, expected: FieldType) -> Self {
        self.expected = Some(expected);
        self
    }

    /// Sets the observed value kind.
    #[must_use]
    pub fn actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on '{}'", self.kind, self.field)?;
        if let Some(expected) = self.expected {
            write!(f, " (expected {expected}")?;
            if let Some(ref actual) = self.actual {
                write!(f, ", got {actual}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// A pipeline row broke its contract after the source boundary.
///
/// This is a Tier-2 failure: the upstream component produced data it
/// promised not to, and the run must stop rather than coerce.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("contract violation at node '{node_id}': {}", summarize(.violations))]
pub struct ContractViolation {
    /// Node whose boundary detected the violation.
    pub node_id: String,
    /// Every field-level problem found.
    pub violations: Vec<FieldViolation>,
}

fn summarize(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_display() {
        let v = FieldViolation::new("age", ViolationKind::TypeMismatch)
            .expected(FieldType::Int)
            .actual("text");
        assert_eq!(v.to_string(), "type_mismatch on 'age' (expected int, got text)");
    }

    #[test]
    fn test_contract_violation_message_lists_all() {
        let err = ContractViolation {
            node_id: "step1".into(),
            violations: vec![
                FieldViolation::new("a", ViolationKind::MissingField),
                FieldViolation::new("b", ViolationKind::ExtraField),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("step1"));
        assert!(msg.contains("missing_field on 'a'"));
        assert!(msg.contains("extra_field on 'b'"));
    }
}
