//! Deterministic JSON for hashing.

use crate::values::RowValue;
use base64::Engine as _;
use thiserror::Error;

/// Errors raised by the canonical and tagged encoders.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalError {
    /// A NaN or infinite float was found.
    #[error("non-finite float {value} at {path} cannot be encoded")]
    NonFiniteFloat {
        /// JSON-pointer-like location of the offending value.
        path: String,
        /// `NaN`, `inf` or `-inf`.
        value: String,
    },

    /// A tagged envelope carried a tag this codec does not know.
    #[error("unknown type tag '{tag}' at {path}")]
    UnknownTypeTag {
        /// Location of the envelope.
        path: String,
        /// The unrecognised tag.
        tag: String,
    },

    /// A tagged envelope was structurally wrong.
    #[error("malformed tagged value at {path}: {reason}")]
    MalformedEnvelope {
        /// Location of the envelope.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Generic serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CanonicalError {
    pub(crate) fn non_finite(path: &str, value: f64) -> Self {
        let value = if value.is_nan() {
            "NaN"
        } else if value.is_sign_positive() {
            "inf"
        } else {
            "-inf"
        };
        Self::NonFiniteFloat {
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            value: value.to_string(),
        }
    }
}

/// Normalises a value to plain JSON suitable for hashing.
///
/// Timestamps become RFC 3339 UTC strings with microseconds, dates become
/// `YYYY-MM-DD`, decimals keep their text, bytes become
/// `{"__bytes__": base64}`.
pub fn to_canonical_value(value: &RowValue) -> Result<serde_json::Value, CanonicalError> {
    normalize(value, "")
}

fn normalize(value: &RowValue, path: &str) -> Result<serde_json::Value, CanonicalError> {
    Ok(match value {
        RowValue::Null => serde_json::Value::Null,
        RowValue::Bool(b) => serde_json::Value::Bool(*b),
        RowValue::Int(i) => serde_json::Value::from(*i),
        RowValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| CanonicalError::non_finite(path, *f))?,
        RowValue::Text(s) => serde_json::Value::String(s.clone()),
        RowValue::Decimal(d) => serde_json::Value::String(d.clone()),
        RowValue::Bytes(b) => serde_json::json!({
            "__bytes__": base64::engine::general_purpose::STANDARD.encode(b)
        }),
        RowValue::Timestamp(ts) => serde_json::Value::String(crate::utils::format_iso8601(ts)),
        RowValue::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
        RowValue::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| normalize(item, &format!("{path}/{i}")))
                .collect::<Result<_, _>>()?,
        ),
        RowValue::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), normalize(v, &format!("{path}/{k}"))?)))
                .collect::<Result<_, CanonicalError>>()?,
        ),
    })
}

/// Serializes a value to canonical JSON text.
///
/// Object keys are sorted and output is compact, so equal values always
/// produce identical bytes.
pub fn canonical_json(value: &RowValue) -> Result<String, CanonicalError> {
    let normalized = to_canonical_value(value)?;
    canonical_json_value(&normalized)
}

/// Serializes plain JSON canonically (sorted keys, compact).
pub fn canonical_json_value(value: &serde_json::Value) -> Result<String, CanonicalError> {
    // Sorted explicitly: `preserve_order` may be enabled elsewhere in the graph.
    let sorted = sort_keys(value);
    serde_json::to_string(&sorted).map_err(|e| CanonicalError::Serialization(e.to_string()))
}

fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_keys(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::RowData;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_keys_sorted_and_compact() {
        let row = RowData::new().with("b", 1).with("a", "x");
        let json = canonical_json(&row.into()).unwrap();
        assert_eq!(json, r#"{"a":"x","b":1}"#);
    }

    #[test]
    fn test_integral_float_keeps_decimal_point() {
        assert_eq!(canonical_json(&RowValue::Float(1.0)).unwrap(), "1.0");
        assert_eq!(canonical_json(&RowValue::Int(1)).unwrap(), "1");
    }

    #[test]
    fn test_timestamp_is_utc_iso() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            canonical_json(&RowValue::Timestamp(ts)).unwrap(),
            r#""2024-01-02T03:04:05.000000+00:00""#
        );
    }

    #[test]
    fn test_rejects_nan_with_path() {
        let row = RowData::new().with(
            "scores",
            RowValue::Array(vec![RowValue::Float(1.0), RowValue::Float(f64::NAN)]),
        );
        let err = canonical_json(&row.into()).unwrap_err();
        assert_eq!(
            err,
            CanonicalError::NonFiniteFloat {
                path: "/scores/1".into(),
                value: "NaN".into()
            }
        );
    }

    #[test]
    fn test_rejects_top_level_infinity() {
        let err = canonical_json(&RowValue::Float(f64::NEG_INFINITY)).unwrap_err();
        assert!(matches!(err, CanonicalError::NonFiniteFloat { ref value, .. } if value == "-inf"));
    }

    #[test]
    fn test_canonical_json_value_sorts_nested() {
        let v = serde_json::json!({"z": {"b": 1, "a": 2}, "a": [ {"d": 1, "c": 2} ]});
        assert_eq!(
            canonical_json_value(&v).unwrap(),
            r#"{"a":[{"c":2,"d":1}],"z":{"a":2,"b":1}}"#
        );
    }
}
