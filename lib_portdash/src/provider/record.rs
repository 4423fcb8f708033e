//! Normalized records.
//!
//! Backend payloads differ in how they name their primary key. Every record
//! handed out by the provider carries an `id`, taken from the first present
//! of `id`, `account_id`, `name` and the resource's natural key (such as a
//! position's `symbol`), falling back to the list position (or the requested
//! id for single-record calls).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::provider::error::{ProviderError, ProviderResult};

/// Keys tried in order when a record has no usable `id`.
const IDENTITY_KEYS: [&str; 3] = ["id", "account_id", "name"];

/// A JSON object guaranteed to contain an `id` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Normalizes one element, using `fallback` as the id when no identity
    /// key is present. Non-object values are wrapped as `{"value": ..}`.
    pub fn normalize(value: Value, fallback: Value) -> Self {
        Self::normalize_keyed(value, None, fallback)
    }

    /// Like [`Record::normalize`], also trying `natural_key` after the
    /// generic identity keys.
    pub fn normalize_keyed(value: Value, natural_key: Option<&str>, fallback: Value) -> Self {
        let mut fields = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let id = IDENTITY_KEYS
            .iter()
            .copied()
            .chain(natural_key)
            .filter_map(|key| fields.get(key))
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(fallback);
        fields.insert("id".to_string(), id);

        Record(fields)
    }

    /// The record id.
    pub fn id(&self) -> &Value {
        self.0.get("id").unwrap_or(&Value::Null)
    }

    /// The id rendered without JSON quoting.
    pub fn id_string(&self) -> String {
        match self.id() {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Looks up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// All fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts back into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Result of a list-style call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSet {
    /// Normalized records in response order.
    pub records: Vec<Record>,
    /// Number of records.
    pub total: usize,
}

impl RecordSet {
    /// Normalizes a list response: arrays keep their order, a bare object is a
    /// one-element list.
    pub fn from_response(body: Value) -> ProviderResult<Self> {
        Self::from_response_keyed(body, None)
    }

    /// [`RecordSet::from_response`] for a resource with a natural key.
    pub fn from_response_keyed(body: Value, natural_key: Option<&str>) -> ProviderResult<Self> {
        let records: Vec<Record> = match body {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(idx, item)| Record::normalize_keyed(item, natural_key, Value::from(idx)))
                .collect(),
            obj @ Value::Object(_) => vec![Record::normalize_keyed(obj, natural_key, Value::from(0))],
            other => return Err(ProviderError::UnexpectedShape(shape_name(&other).to_string())),
        };
        let total = records.len();
        Ok(Self { records, total })
    }

    /// True when the set holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Normalizes a single-record response for the requested `id`.
///
/// Empty bodies (`null`) become `{"id": id}`.
pub fn single_record(body: Value, id: &str) -> ProviderResult<Record> {
    let fallback = Value::String(id.to_string());
    match body {
        Value::Null => Ok(Record::normalize(Value::Object(Map::new()), fallback)),
        obj @ Value::Object(_) => Ok(Record::normalize(obj, fallback)),
        other => Err(ProviderError::UnexpectedShape(shape_name(&other).to_string())),
    }
}

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_fallback_order() {
        let set = RecordSet::from_response(json!([
            {"id": 7, "account_id": "DU9"},
            {"account_id": "DU123", "name": "main"},
            {"name": "web"},
            {"cpu": 0.5},
            "loose"
        ]))
        .unwrap();

        assert_eq!(set.total, 5);
        let ids: Vec<_> = set.records.iter().map(|r| r.id().clone()).collect();
        assert_eq!(ids, vec![json!(7), json!("DU123"), json!("web"), json!(3), json!(4)]);
        assert_eq!(set.records[4].get("value"), Some(&json!("loose")));
        assert_eq!(set.records[1].get("account_id"), Some(&json!("DU123")));
    }

    #[test]
    fn test_null_id_falls_through() {
        let record = Record::normalize(json!({"id": null, "account_id": "DU1"}), json!(0));
        assert_eq!(record.id_string(), "DU1");
    }

    #[test]
    fn test_natural_key_survives_reordering() {
        let first = RecordSet::from_response_keyed(
            json!([{"symbol": "AAPL", "qty": 10}, {"symbol": "MSFT", "qty": 5}, {"qty": 1}]),
            Some("symbol"),
        )
        .unwrap();
        let reordered = RecordSet::from_response_keyed(
            json!([{"symbol": "MSFT", "qty": 5}, {"symbol": "AAPL", "qty": 10}]),
            Some("symbol"),
        )
        .unwrap();

        let ids: Vec<_> = first.records.iter().map(|r| r.id_string()).collect();
        assert_eq!(ids, vec!["AAPL", "MSFT", "2"]);
        assert_eq!(reordered.records[1].id_string(), "AAPL");
        assert_eq!(reordered.records[1].get("qty"), Some(&json!(10)));
    }

    #[test]
    fn test_generic_keys_win_over_natural_key() {
        let record = Record::normalize_keyed(json!({"name": "web", "symbol": "X"}), Some("symbol"), json!(0));
        assert_eq!(record.id_string(), "web");
    }

    #[test]
    fn test_bare_object_is_single_element_list() {
        let set = RecordSet::from_response(json!({"HOST": "x", "PORT": "1"})).unwrap();
        assert_eq!(set.total, 1);
        assert_eq!(set.records[0].id(), &json!(0));
        assert_eq!(set.records[0].get("HOST"), Some(&json!("x")));
    }

    #[test]
    fn test_scalar_list_response_is_rejected() {
        assert!(matches!(
            RecordSet::from_response(json!("ok")),
            Err(ProviderError::UnexpectedShape(s)) if s == "string"
        ));
    }

    #[test]
    fn test_single_record_uses_requested_id() {
        let record = single_record(json!({"cpu": 1}), "c1").unwrap();
        assert_eq!(record.id_string(), "c1");

        let empty = single_record(Value::Null, "id1").unwrap();
        assert_eq!(empty.into_value(), json!({"id": "id1"}));
    }
}
