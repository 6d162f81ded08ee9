//! Schema-less records.
//!
//! The set of fields a record carries is decided at query time by the field
//! selection, so records are ordered maps from field name to a tagged JSON
//! value rather than per-entity structs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One record as returned by the source, fields in source order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from a JSON value.
    ///
    /// Returns `None` unless the value is an object.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Set a field, keeping its position if it already exists.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Builder-style [`Record::insert`].
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Field names in order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying map.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Convert into a JSON object value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_order_is_preserved() {
        let record = Record::from_value(json!({"zeta": 1, "alpha": 2, "mid": 3})).unwrap();
        let fields: Vec<_> = record.fields().collect();
        assert_eq!(fields, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_non_objects_are_rejected() {
        assert!(Record::from_value(json!([1, 2])).is_none());
        assert!(Record::from_value(json!("text")).is_none());
        assert!(Record::from_value(Value::Null).is_none());
    }

    #[test]
    fn test_nested_values_survive() {
        let record = Record::new()
            .with("id", 7)
            .with("tags", json!(["a", "b"]))
            .with("owner", json!({"name": "x", "active": true}))
            .with("note", Value::Null);
        assert_eq!(record.len(), 4);
        assert_eq!(record.get("owner").unwrap()["active"], json!(true));

        let text = serde_json::to_string(&record).unwrap();
        assert!(text.starts_with("{\"id\":7"));
    }
}
