//! Content hashing.

use super::encoder::{canonical_json, canonical_json_value, CanonicalError};
use crate::values::{RowData, RowValue};
use sha2::{Digest, Sha256};

/// SHA-256 of raw bytes, lowercase hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content hash of a value: SHA-256 over its canonical JSON.
pub fn stable_hash(value: &RowValue) -> Result<String, CanonicalError> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

/// Content hash of a row.
pub fn stable_hash_row(row: &RowData) -> Result<String, CanonicalError> {
    stable_hash(&RowValue::Map(row.as_map().clone()))
}

/// Content hash of plain JSON (settings, plugin config, call payloads).
pub fn stable_hash_json(value: &serde_json::Value) -> Result<String, CanonicalError> {
    Ok(sha256_hex(canonical_json_value(value)?.as_bytes()))
}

/// Debug representation of a value that may not be canonically encodable.
#[must_use]
pub fn safe_repr(value: &RowValue) -> String {
    format!("{value:?}")
}

/// Hash of [`safe_repr`], used when quarantined input cannot be hashed
/// canonically (e.g. it contains NaN).
#[must_use]
pub fn repr_hash(value: &RowValue) -> String {
    sha256_hex(safe_repr(value).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_order_independent() {
        let a = RowData::new().with("x", 1).with("y", 2);
        let b = RowData::new().with("y", 2).with("x", 1);
        assert_eq!(stable_hash_row(&a).unwrap(), stable_hash_row(&b).unwrap());
    }

    #[test]
    fn test_hash_distinguishes_int_and_float() {
        assert_ne!(
            stable_hash(&RowValue::Int(1)).unwrap(),
            stable_hash(&RowValue::Float(1.0)).unwrap()
        );
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let h = stable_hash(&RowValue::Text("abc".into())).unwrap();
        assert_eq!(h.len(), 64);
        assert_eq!(h, sha256_hex(br#""abc""#));
    }

    #[test]
    fn test_repr_hash_accepts_nan() {
        let h = repr_hash(&RowValue::Float(f64::NAN));
        assert_eq!(h.len(), 64);
        assert!(stable_hash(&RowValue::Float(f64::NAN)).is_err());
    }

    #[test]
    fn test_json_hash_ignores_key_order() {
        let a = serde_json::json!({"a": 1, "b": [1, 2]});
        let b = serde_json::json!({"b": [1, 2], "a": 1});
        assert_eq!(stable_hash_json(&a).unwrap(), stable_hash_json(&b).unwrap());
    }
}
