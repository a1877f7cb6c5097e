//! The [`RowData`] map.

use super::RowValue;
use std::collections::BTreeMap;

/// One row: field name to value, in deterministic key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowData {
    fields: BTreeMap<String, RowValue>,
}

impl RowData {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a row from `(name, value)` pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<RowValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Builds a row from a JSON object. Returns `None` for non-objects.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        value.as_object().map(|map| Self {
            fields: map
                .iter()
                .map(|(k, v)| (k.clone(), RowValue::from_json(v)))
                .collect(),
        })
    }

    /// Renders the row as a plain JSON object (lossy, see
    /// [`RowValue::to_json`]).
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Returns a field's value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RowValue> {
        self.fields.get(name)
    }

    /// Sets a field, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<RowValue>) -> Option<RowValue> {
        self.fields.insert(name.into(), value.into())
    }

    /// Removes a field.
    pub fn remove(&mut self, name: &str) -> Option<RowValue> {
        self.fields.remove(name)
    }

    /// Sets a field and returns the row, for fluent construction.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<RowValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Returns true if the field is present (even when null).
    #[must_use]
    pub fn contains_key(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Iterates field names in order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Iterates `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &RowValue)> {
        self.fields.iter()
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the row has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Consumes the row, returning the underlying map.
    #[must_use]
    pub fn into_inner(self) -> BTreeMap<String, RowValue> {
        self.fields
    }

    /// Borrows the underlying map.
    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, RowValue> {
        &self.fields
    }
}

impl From<BTreeMap<String, RowValue>> for RowData {
    fn from(fields: BTreeMap<String, RowValue>) -> Self {
        Self { fields }
    }
}

impl From<RowData> for RowValue {
    fn from(row: RowData) -> Self {
        Self::Map(row.fields)
    }
}

impl FromIterator<(String, RowValue)> for RowData {
    fn from_iter<T: IntoIterator<Item = (String, RowValue)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a RowData {
    type Item = (&'a String, &'a RowValue);
    type IntoIter = std::collections::btree_map::Iter<'a, String, RowValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl IntoIterator for RowData {
    type Item = (String, RowValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, RowValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_pairs_and_get() {
        let row = RowData::from_pairs([("id", RowValue::Int(1)), ("name", "alice".into())]);
        assert_eq!(row.get("id"), Some(&RowValue::Int(1)));
        assert_eq!(row.len(), 2);
        assert!(row.contains_key("name"));
    }

    #[test]
    fn test_keys_are_sorted() {
        let row = RowData::new().with("b", 2).with("a", 1);
        let keys: Vec<&String> = row.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_json_round_trip_plain_values() {
        let value = json!({"id": 7, "tags": ["x"], "score": 0.5});
        let row = RowData::from_json(&value).unwrap();
        assert_eq!(row.to_json(), value);
        assert!(RowData::from_json(&json!([1, 2])).is_none());
    }
}
