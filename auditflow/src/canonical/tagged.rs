//! Type-preserving tagged JSON.

use super::encoder::CanonicalError;
use crate::utils::{format_iso8601_exact, parse_date, parse_timestamp};
use crate::values::{RowData, RowValue};
use base64::Engine as _;
use std::collections::BTreeMap;

/// Key marking a tagged envelope.
pub const TYPE_TAG_KEY: &str = "__af_type__";
const VALUE_KEY: &str = "value";

const TAG_DATETIME: &str = "datetime";
const TAG_DATE: &str = "date";
const TAG_DECIMAL: &str = "decimal";
const TAG_BYTES: &str = "bytes";
const TAG_MAP: &str = "map";

fn envelope(tag: &str, value: serde_json::Value) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(TYPE_TAG_KEY.to_string(), serde_json::Value::String(tag.to_string()));
    map.insert(VALUE_KEY.to_string(), value);
    serde_json::Value::Object(map)
}

/// Encodes a value into tagged JSON.
///
/// Fails before producing anything if a NaN or infinity appears at any
/// depth.
pub fn encode_tagged(value: &RowValue) -> Result<serde_json::Value, CanonicalError> {
    encode_at(value, "")
}

fn encode_at(value: &RowValue, path: &str) -> Result<serde_json::Value, CanonicalError> {
    Ok(match value {
        RowValue::Null => serde_json::Value::Null,
        RowValue::Bool(b) => serde_json::Value::Bool(*b),
        RowValue::Int(i) => serde_json::Value::from(*i),
        RowValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| CanonicalError::non_finite(path, *f))?,
        RowValue::Text(s) => serde_json::Value::String(s.clone()),
        RowValue::Timestamp(ts) => {
            envelope(TAG_DATETIME, serde_json::Value::String(format_iso8601_exact(ts)))
        }
        RowValue::Date(d) => envelope(
            TAG_DATE,
            serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
        ),
        RowValue::Decimal(d) => envelope(TAG_DECIMAL, serde_json::Value::String(d.clone())),
        RowValue::Bytes(b) => envelope(
            TAG_BYTES,
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
        ),
        RowValue::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| encode_at(item, &format!("{path}/{i}")))
                .collect::<Result<_, _>>()?,
        ),
        RowValue::Map(map) => {
            let encoded: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| Ok((k.clone(), encode_at(v, &format!("{path}/{k}"))?)))
                .collect::<Result<_, CanonicalError>>()?;
            // A user map that happens to use the tag key is wrapped so it
            // cannot be mistaken for an envelope on decode.
            if map.contains_key(TYPE_TAG_KEY) {
                envelope(TAG_MAP, serde_json::Value::Object(encoded))
            } else {
                serde_json::Value::Object(encoded)
            }
        }
    })
}

/// Encodes a row into tagged JSON.
pub fn encode_tagged_row(row: &RowData) -> Result<serde_json::Value, CanonicalError> {
    encode_at(&RowValue::Map(row.as_map().clone()), "")
}

/// Encodes a value into tagged JSON text.
pub fn encode_tagged_string(value: &RowValue) -> Result<String, CanonicalError> {
    let encoded = encode_tagged(value)?;
    serde_json::to_string(&encoded).map_err(|e| CanonicalError::Serialization(e.to_string()))
}

/// Decodes tagged JSON back into a value, restoring typed variants.
pub fn decode_tagged(value: &serde_json::Value) -> Result<RowValue, CanonicalError> {
    decode_at(value, "")
}

/// Decodes tagged JSON text.
pub fn decode_tagged_str(text: &str) -> Result<RowValue, CanonicalError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| CanonicalError::Serialization(e.to_string()))?;
    decode_tagged(&value)
}

/// Decodes tagged JSON that must be an object into a row.
pub fn decode_tagged_row(value: &serde_json::Value) -> Result<RowData, CanonicalError> {
    match decode_tagged(value)? {
        RowValue::Map(map) => Ok(RowData::from(map)),
        other => Err(CanonicalError::MalformedEnvelope {
            path: "/".to_string(),
            reason: format!("expected a row object, found {}", other.kind()),
        }),
    }
}

fn decode_at(value: &serde_json::Value, path: &str) -> Result<RowValue, CanonicalError> {
    Ok(match value {
        serde_json::Value::Null => RowValue::Null,
        serde_json::Value::Bool(b) => RowValue::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => RowValue::Int(i),
            None => RowValue::Float(n.as_f64().ok_or_else(|| CanonicalError::MalformedEnvelope {
                path: path.to_string(),
                reason: format!("unrepresentable number {n}"),
            })?),
        },
        serde_json::Value::String(s) => RowValue::Text(s.clone()),
        serde_json::Value::Array(items) => RowValue::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| decode_at(item, &format!("{path}/{i}")))
                .collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(map) => match map.get(TYPE_TAG_KEY) {
            Some(tag) => decode_envelope(map, tag, path)?,
            None => RowValue::Map(decode_map(map, path)?),
        },
    })
}

fn decode_map(
    map: &serde_json::Map<String, serde_json::Value>,
    path: &str,
) -> Result<BTreeMap<String, RowValue>, CanonicalError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), decode_at(v, &format!("{path}/{k}"))?)))
        .collect()
}

fn decode_envelope(
    map: &serde_json::Map<String, serde_json::Value>,
    tag: &serde_json::Value,
    path: &str,
) -> Result<RowValue, CanonicalError> {
    let malformed = |reason: &str| CanonicalError::MalformedEnvelope {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let tag = tag.as_str().ok_or_else(|| malformed("type tag is not a string"))?;
    let inner = map.get(VALUE_KEY).ok_or_else(|| malformed("missing 'value'"))?;

    if tag == TAG_MAP {
        let obj = inner
            .as_object()
            .ok_or_else(|| malformed("map envelope value is not an object"))?;
        return Ok(RowValue::Map(decode_map(obj, path)?));
    }

    let text = inner
        .as_str()
        .ok_or_else(|| malformed("envelope value is not a string"))?;
    match tag {
        TAG_DATETIME => parse_timestamp(text)
            .map(RowValue::Timestamp)
            .map_err(|e| malformed(&e.to_string())),
        TAG_DATE => parse_date(text)
            .map(RowValue::Date)
            .map_err(|e| malformed(&e.to_string())),
        TAG_DECIMAL => Ok(RowValue::Decimal(text.to_string())),
        TAG_BYTES => base64::engine::general_purpose::STANDARD
            .decode(text)
            .map(RowValue::Bytes)
            .map_err(|e| malformed(&e.to_string())),
        other => Err(CanonicalError::UnknownTypeTag {
            path: path.to_string(),
            tag: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Timelike, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> RowValue {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()
            + chrono::Duration::microseconds(123_456);
        RowData::new()
            .with("created", ts)
            .with("day", NaiveDate::from_ymd_opt(2024, 5, 6).unwrap())
            .with("amount", RowValue::Decimal("10.50".into()))
            .with("blob", RowValue::Bytes(vec![0, 1, 255]))
            .with(
                "nested",
                RowValue::Map(
                    [(
                        "history".to_string(),
                        RowValue::Array(vec![RowValue::Timestamp(ts), RowValue::Float(2.0)]),
                    )]
                    .into_iter()
                    .collect(),
                ),
            )
            .into()
    }

    #[test]
    fn test_round_trip_restores_types() {
        let original = sample();
        let encoded = encode_tagged(&original).unwrap();
        assert_eq!(decode_tagged(&encoded).unwrap(), original);
    }

    #[test]
    fn test_round_trip_through_text() {
        let original = sample();
        let text = encode_tagged_string(&original).unwrap();
        assert_eq!(decode_tagged_str(&text).unwrap(), original);
    }

    #[test]
    fn test_datetime_envelope_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            encode_tagged(&RowValue::Timestamp(ts)).unwrap(),
            json!({"__af_type__": "datetime", "value": "2024-01-01T00:00:00+00:00"})
        );
    }

    #[test]
    fn test_nanosecond_datetime_round_trips() {
        let ts = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .unwrap()
            .with_nanosecond(123_456_789)
            .unwrap();
        let encoded = encode_tagged(&RowValue::Timestamp(ts)).unwrap();
        assert_eq!(
            encoded,
            json!({"__af_type__": "datetime", "value": "2024-01-01T00:00:00.123456789+00:00"})
        );
        assert_eq!(decode_tagged(&encoded).unwrap(), RowValue::Timestamp(ts));
    }

    #[test]
    fn test_naive_datetime_decodes_as_utc() {
        let decoded =
            decode_tagged(&json!({"__af_type__": "datetime", "value": "2024-01-01T12:00:00"}))
                .unwrap();
        assert_eq!(
            decoded,
            RowValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_rejects_non_finite_at_every_depth() {
        let top = RowValue::Float(f64::NAN);
        let in_map: RowValue = RowData::new().with("x", f64::INFINITY).into();
        let in_array = RowValue::Array(vec![RowValue::Int(1), RowValue::Float(f64::NEG_INFINITY)]);
        for value in [top, in_map, in_array] {
            assert!(matches!(
                encode_tagged(&value),
                Err(CanonicalError::NonFiniteFloat { .. })
            ));
        }
    }

    #[test]
    fn test_user_map_with_tag_key_survives() {
        let original: RowValue = RowData::new()
            .with(TYPE_TAG_KEY, "not an envelope")
            .with("value", 3)
            .into();
        let encoded = encode_tagged(&original).unwrap();
        assert_eq!(decode_tagged(&encoded).unwrap(), original);
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let err = decode_tagged(&json!({"__af_type__": "uuid", "value": "x"})).unwrap_err();
        assert!(matches!(err, CanonicalError::UnknownTypeTag { ref tag, .. } if tag == "uuid"));
    }

    #[test]
    fn test_float_stays_float() {
        let encoded = encode_tagged(&RowValue::Float(3.0)).unwrap();
        assert_eq!(decode_tagged(&encoded).unwrap(), RowValue::Float(3.0));
    }
}
