//! Item keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The unique key of an item within a collection.
///
/// Keys are either integers or strings. Integers order before strings so that
/// a collection mixing both still has a total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    /// Convert a JSON value into a key.
    ///
    /// Only integral numbers and strings are valid keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Key::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(Key::Int),
            _ => None,
        }
    }

    /// The key as a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::from(*i),
            Key::Str(s) => Value::from(s.clone()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<&String> for Key {
    fn from(s: &String) -> Self {
        Key::Str(s.clone())
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Int(i64::from(i))
    }
}

impl From<&Key> for Key {
    fn from(k: &Key) -> Self {
        k.clone()
    }
}

/// A key qualified by the collection that owns it.
///
/// Transactions span collections, so mutation merging is keyed by this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalKey {
    pub collection_id: String,
    pub key: Key,
}

impl GlobalKey {
    pub fn new(collection_id: impl Into<String>, key: Key) -> Self {
        Self {
            collection_id: collection_id.into(),
            key,
        }
    }
}

impl fmt::Display for GlobalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KEY::{}/{}", self.collection_id, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_from_values() {
        assert_eq!(Key::from_value(&json!("a")), Some(Key::from("a")));
        assert_eq!(Key::from_value(&json!(42)), Some(Key::Int(42)));
        assert_eq!(Key::from_value(&json!(1.5)), None);
        assert_eq!(Key::from_value(&json!(null)), None);
        assert_eq!(Key::from_value(&json!({"id": 1})), None);
    }

    #[test]
    fn ints_order_before_strings() {
        let mut keys = vec![Key::from("b"), Key::Int(10), Key::from("a"), Key::Int(2)];
        keys.sort();
        assert_eq!(
            keys,
            vec![Key::Int(2), Key::Int(10), Key::from("a"), Key::from("b")]
        );
    }

    #[test]
    fn untagged_serialization() {
        assert_eq!(serde_json::to_string(&Key::Int(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&Key::from("x")).unwrap(), "\"x\"");
        let parsed: Key = serde_json::from_str("\"todo\"").unwrap();
        assert_eq!(parsed, Key::from("todo"));
    }

    #[test]
    fn global_key_display() {
        let key = GlobalKey::new("todos", Key::Int(1));
        assert_eq!(key.to_string(), "KEY::todos/1");
    }
}
