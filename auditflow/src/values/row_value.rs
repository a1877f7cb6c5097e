//! The [`RowValue`] tagged union.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Discriminant of a [`RowValue`], without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Absent value.
    Null,
    /// Boolean.
    Bool,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Bytes,
    /// UTC timestamp.
    Timestamp,
    /// Calendar date.
    Date,
    /// Exact decimal, kept in normalised text form.
    Decimal,
    /// Ordered list.
    Array,
    /// String-keyed map.
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Bytes => "bytes",
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Decimal => "decimal",
            Self::Array => "array",
            Self::Map => "map",
        };
        f.write_str(name)
    }
}

/// A single value inside a row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float. May be non-finite in memory; the canonical encoder
    /// refuses to serialize NaN and infinities.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
    /// Calendar date.
    Date(NaiveDate),
    /// Exact decimal in normalised text form (e.g. `"12.50"`).
    Decimal(String),
    /// Ordered list.
    Array(Vec<RowValue>),
    /// String-keyed map with deterministic key order.
    Map(BTreeMap<String, RowValue>),
}

impl RowValue {
    /// Returns the discriminant of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Text(_) => ValueKind::Text,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::Date(_) => ValueKind::Date,
            Self::Decimal(_) => ValueKind::Decimal,
            Self::Array(_) => ValueKind::Array,
            Self::Map(_) => ValueKind::Map,
        }
    }

    /// Returns true for [`RowValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true if this value, or anything nested in it, is a NaN or
    /// infinite float.
    #[must_use]
    pub fn contains_non_finite(&self) -> bool {
        match self {
            Self::Float(f) => !f.is_finite(),
            Self::Array(items) => items.iter().any(Self::contains_non_finite),
            Self::Map(map) => map.values().any(Self::contains_non_finite),
            _ => false,
        }
    }

    /// Returns the text payload, if this is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, if this is an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns a float view of numeric values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Returns the boolean payload, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Builds a value from plain JSON.
    ///
    /// Integers that fit in `i64` become [`RowValue::Int`]; every other
    /// number becomes [`RowValue::Float`].
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            serde_json::Value::String(s) => Self::Text(s.clone()),
            serde_json::Value::Array(items) => Self::Array(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Renders the value as plain JSON for display and plugin interop.
    ///
    /// This is lossy: timestamps, dates and decimals become strings, bytes
    /// become base64 text, and non-finite floats become `null`. Use the
    /// tagged codec in [`crate::canonical`] when types must survive.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use base64::Engine as _;
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Text(s) | Self::Decimal(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Self::Timestamp(ts) => {
                serde_json::Value::String(crate::utils::format_iso8601(ts))
            }
            Self::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Self::Array(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<bool> for RowValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for RowValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for RowValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for RowValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for RowValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RowValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for RowValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<NaiveDate> for RowValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<Vec<RowValue>> for RowValue {
    fn from(value: Vec<RowValue>) -> Self {
        Self::Array(value)
    }
}

impl<T: Into<RowValue>> From<Option<T>> for RowValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_numbers() {
        assert_eq!(RowValue::from_json(&json!(42)), RowValue::Int(42));
        assert_eq!(RowValue::from_json(&json!(1.5)), RowValue::Float(1.5));
        assert_eq!(
            RowValue::from_json(&json!(u64::MAX)),
            RowValue::Float(u64::MAX as f64)
        );
    }

    #[test]
    fn test_from_json_nested() {
        let v = RowValue::from_json(&json!({"a": [1, "x", null]}));
        let RowValue::Map(map) = v else {
            panic!("expected map");
        };
        assert_eq!(
            map.get("a"),
            Some(&RowValue::Array(vec![
                RowValue::Int(1),
                RowValue::Text("x".into()),
                RowValue::Null
            ]))
        );
    }

    #[test]
    fn test_contains_non_finite_nested() {
        let v = RowValue::Array(vec![RowValue::Map(
            [("x".to_string(), RowValue::Float(f64::INFINITY))]
                .into_iter()
                .collect(),
        )]);
        assert!(v.contains_non_finite());
        assert!(!RowValue::Float(1.0).contains_non_finite());
    }

    #[test]
    fn test_to_json_is_lossy_for_typed_values() {
        let d = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(RowValue::Date(d).to_json(), json!("2024-02-29"));
        assert_eq!(RowValue::Float(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(RowValue::Bytes(b"hi".to_vec()).to_json(), json!("aGk="));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(RowValue::Int(1).kind().to_string(), "int");
        assert_eq!(RowValue::Null.kind().to_string(), "null");
    }
}
