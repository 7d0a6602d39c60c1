//! Recursive tagged value used for execution variables, snapshot state, and
//! snapshot metadata.
//!
//! Values cross the storage boundary and are diffed by tooling outside the
//! engine, so they serialize to plain JSON with ordered map keys. Equality is
//! structural; floats compare by total order so that every value is equal to
//! itself (including NaN).
//!
//! JSON has no NaN or infinity: those floats serialize to `null`, so the
//! round-trip is lossy for them. Snapshot writers check [`Value::is_finite`]
//! and refuse to persist such values.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered key-value bag (execution variables, snapshot state and metadata).
pub type ValueMap = BTreeMap<String, Value>;

/// A dynamically typed value: a primitive, an array, or a map of the same.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(ValueMap),
}

impl Value {
    /// Short name of the variant, used when rendering diffs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// False if any float inside is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Float(f) => f.is_finite(),
            Value::Array(items) => items.iter().all(Value::is_finite),
            Value::Map(map) => map.values().all(Value::is_finite),
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::String(_) => true,
        }
    }

    /// Look up a nested value by a dotted path (`order.items.0.sku`).
    ///
    /// Map segments are keys; array segments are zero-based indices. An empty
    /// path returns `self`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                Value::Map(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Key of the first entry holding a NaN or infinite float, if any.
pub fn first_non_finite(map: &ValueMap) -> Option<&str> {
    map.iter()
        .find(|(_, v)| !v.is_finite())
        .map(|(k, _)| k.as_str())
}

/// Look up a dotted path starting at a top-level map.
pub fn lookup_path<'a>(map: &'a ValueMap, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (path, ""),
    };
    map.get(head)?.get_path(rest)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b) == Ordering::Equal,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json: serde_json::Value = self.clone().into();
        write!(f, "{json}")
    }
}

// ---------------------------------------------------------------------------
// JSON conversion (the serde representation)
// ---------------------------------------------------------------------------

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            // Non-finite floats have no JSON form and become null.
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_map() -> ValueMap {
        let json = json!({
            "order": {
                "id": 42,
                "items": [{"sku": "A-1", "qty": 2}, {"sku": "B-7", "qty": 1}]
            },
            "total": 19.5,
            "paid": false
        });
        match Value::from(json) {
            Value::Map(map) => map,
            other => panic!("expected map, got {other:?}"),
        }
    }

    #[test]
    fn test_json_integers_stay_integers() {
        let v = Value::from(json!(7));
        assert_eq!(v, Value::Int(7));
        let v = Value::from(json!(7.0));
        assert_eq!(v, Value::Float(7.0));
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn test_map_keys_serialize_in_order() {
        let mut map = ValueMap::new();
        map.insert("zeta".to_string(), Value::from(1));
        map.insert("alpha".to_string(), Value::from(2));
        let out = serde_json::to_string(&Value::Map(map)).unwrap();
        assert_eq!(out, r#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn test_nan_is_equal_to_itself() {
        let v = Value::Float(f64::NAN);
        assert_eq!(v, v.clone());
    }

    #[test]
    fn test_non_finite_float_serializes_as_null() {
        let out = serde_json::to_string(&Value::Float(f64::INFINITY)).unwrap();
        assert_eq!(out, "null");
    }

    #[test]
    fn test_is_finite_looks_inside_containers() {
        assert!(Value::Float(1.5).is_finite());
        assert!(!Value::Float(f64::INFINITY).is_finite());

        let mut inner = ValueMap::new();
        inner.insert("ratio".into(), Value::Float(f64::NAN));
        let nested = Value::Array(vec![Value::Int(1), Value::Map(inner)]);
        assert!(!nested.is_finite());

        let mut vars = ValueMap::new();
        vars.insert("a".into(), Value::Int(1));
        assert_eq!(first_non_finite(&vars), None);
        vars.insert("b".into(), nested);
        assert_eq!(first_non_finite(&vars), Some("b"));
    }

    #[test]
    fn test_deserialize_nested_structure() {
        let v: Value = serde_json::from_str(r#"{"a":[1,"two",null,{"b":true}]}"#).unwrap();
        let items = v.get_path("a").unwrap();
        assert_eq!(items.get_path("1"), Some(&Value::from("two")));
        assert_eq!(items.get_path("3.b"), Some(&Value::Bool(true)));
        assert_eq!(items.get_path("2"), Some(&Value::Null));
    }

    #[test]
    fn test_lookup_path_through_maps_and_arrays() {
        let map = sample_map();
        assert_eq!(lookup_path(&map, "order.id"), Some(&Value::Int(42)));
        assert_eq!(
            lookup_path(&map, "order.items.1.sku"),
            Some(&Value::from("B-7"))
        );
        assert_eq!(lookup_path(&map, "total"), Some(&Value::Float(19.5)));
        assert!(lookup_path(&map, "order.items.9").is_none());
        assert!(lookup_path(&map, "paid.deeper").is_none());
        assert!(lookup_path(&map, "missing").is_none());
    }

    #[test]
    fn test_display_is_compact_json() {
        assert_eq!(Value::from("hi").to_string(), "\"hi\"");
        assert_eq!(Value::Array(vec![1.into(), Value::Null]).to_string(), "[1,null]");
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Null.type_name(), "null");
        assert_eq!(Value::Map(ValueMap::new()).type_name(), "map");
        assert_eq!(Value::from(Some(3)).type_name(), "int");
        assert_eq!(Value::from(None::<i64>).type_name(), "null");
    }
}
