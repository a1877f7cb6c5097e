//! Field-level contract types.

use super::normalize_field_name;
use crate::utils::{parse_date, parse_timestamp};
use crate::values::RowValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The type a field is guaranteed to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Anything, including null.
    Any,
    /// Boolean.
    Bool,
    /// Integer.
    Int,
    /// Float. Integers are accepted without coercion.
    Float,
    /// Text.
    Text,
    /// Raw bytes.
    Bytes,
    /// UTC timestamp.
    Timestamp,
    /// Calendar date.
    Date,
    /// Exact decimal.
    Decimal,
    /// Opaque container (array or map) whose inner shape is not tracked.
    Object,
}

impl FieldType {
    /// Guesses a type from a runtime value.
    ///
    /// Returns `None` for values that must never be inferred: NaN and
    /// infinities. Null infers [`FieldType::Any`].
    #[must_use]
    pub fn infer(value: &RowValue) -> Option<Self> {
        match value {
            RowValue::Null => Some(Self::Any),
            RowValue::Bool(_) => Some(Self::Bool),
            RowValue::Int(_) => Some(Self::Int),
            RowValue::Float(f) if !f.is_finite() => None,
            RowValue::Float(_) => Some(Self::Float),
            RowValue::Text(_) => Some(Self::Text),
            RowValue::Bytes(_) => Some(Self::Bytes),
            RowValue::Timestamp(_) => Some(Self::Timestamp),
            RowValue::Date(_) => Some(Self::Date),
            RowValue::Decimal(_) => Some(Self::Decimal),
            RowValue::Array(_) | RowValue::Map(_) => Some(Self::Object),
        }
    }

    /// Returns true if `value` satisfies this type as-is. Null is handled
    /// by the caller against `required`.
    #[must_use]
    pub fn accepts(&self, value: &RowValue) -> bool {
        match (self, value) {
            (Self::Any, _) => true,
            (Self::Bool, RowValue::Bool(_))
            | (Self::Int, RowValue::Int(_))
            | (Self::Float, RowValue::Float(_) | RowValue::Int(_))
            | (Self::Text, RowValue::Text(_))
            | (Self::Bytes, RowValue::Bytes(_))
            | (Self::Timestamp, RowValue::Timestamp(_))
            | (Self::Date, RowValue::Date(_))
            | (Self::Decimal, RowValue::Decimal(_))
            | (Self::Object, RowValue::Array(_) | RowValue::Map(_)) => true,
            _ => false,
        }
    }

    /// Attempts a source-boundary coercion of `value` into this type.
    ///
    /// Only conversions from text (and int to float) are supported. Returns
    /// `None` when the value cannot be converted.
    #[must_use]
    pub fn coerce(&self, value: &RowValue) -> Option<RowValue> {
        if self.accepts(value) {
            return Some(match (self, value) {
                (Self::Float, RowValue::Int(i)) => RowValue::Float(*i as f64),
                _ => value.clone(),
            });
        }
        let RowValue::Text(text) = value else {
            return None;
        };
        let text = text.trim();
        match self {
            Self::Int => text.parse::<i64>().ok().map(RowValue::Int),
            Self::Float => text
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(RowValue::Float),
            Self::Bool => match text.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(RowValue::Bool(true)),
                "false" | "0" | "no" => Some(RowValue::Bool(false)),
                _ => None,
            },
            Self::Timestamp => parse_timestamp(text).ok().map(RowValue::Timestamp),
            Self::Date => parse_date(text).ok().map(RowValue::Date),
            Self::Decimal => normalize_decimal(text).map(RowValue::Decimal),
            _ => None,
        }
    }
}

fn normalize_decimal(text: &str) -> Option<String> {
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.strip_prefix('+').unwrap_or(text)),
    };
    let mut parts = digits.splitn(2, '.');
    let int_part = parts.next().unwrap_or_default();
    let frac_part = parts.next();

    let int_ok = !int_part.is_empty() && int_part.chars().all(|c| c.is_ascii_digit());
    let frac_ok = frac_part.map_or(true, |f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()));
    if !int_ok || !frac_ok {
        return None;
    }

    let int_part = int_part.trim_start_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    Some(match frac_part {
        Some(frac) => format!("{sign}{int_part}.{frac}"),
        None => format!("{sign}{int_part}"),
    })
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Bytes => "bytes",
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Decimal => "decimal",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// Where knowledge of a field came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// Written in configuration by the pipeline author.
    Declared,
    /// Added at runtime from a value the contract did not yet know.
    Inferred,
    /// Learned from the first row of an OBSERVED source.
    Observed,
}

impl fmt::Display for FieldSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Declared => write!(f, "declared"),
            Self::Inferred => write!(f, "inferred"),
            Self::Observed => write!(f, "observed"),
        }
    }
}

/// Contract for one field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldContract {
    /// Identifier-safe name, used as the row key.
    pub normalized_name: String,
    /// Name as it appeared at the source.
    pub original_name: String,
    /// Guaranteed value type.
    pub field_type: FieldType,
    /// Whether the field must be present and non-null.
    pub required: bool,
    /// Provenance of this field's description.
    pub source: FieldSource,
}

impl FieldContract {
    /// A declared field. The normalized name is derived from `name`.
    #[must_use]
    pub fn declared(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        let original_name = name.into();
        Self {
            normalized_name: normalize_field_name(&original_name),
            original_name,
            field_type,
            required,
            source: FieldSource::Declared,
        }
    }

    /// A field learned at runtime from a row key. Never required.
    #[must_use]
    pub fn inferred(name: &str, field_type: FieldType, source: FieldSource) -> Self {
        Self {
            normalized_name: name.to_string(),
            original_name: name.to_string(),
            field_type,
            required: false,
            source,
        }
    }

    /// Returns true if `name` refers to this field by either name.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.normalized_name == name || self.original_name == name
    }
}
