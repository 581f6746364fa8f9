//! Change messages delivered to subscribers.

use crate::Key;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of observable change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// The atomic unit of observable state change.
///
/// For deletes, `value` carries the last visible value of the removed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMessage {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub key: Key,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChangeMessage {
    pub fn insert(key: Key, value: Value) -> Self {
        Self {
            change_type: ChangeType::Insert,
            key,
            value,
            previous_value: None,
            metadata: None,
        }
    }

    pub fn update(key: Key, value: Value, previous_value: Value) -> Self {
        Self {
            change_type: ChangeType::Update,
            key,
            value,
            previous_value: Some(previous_value),
            metadata: None,
        }
    }

    pub fn delete(key: Key, value: Value) -> Self {
        Self {
            change_type: ChangeType::Delete,
            key,
            value,
            previous_value: None,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Value>) -> Self {
        self.metadata = metadata;
        self
    }
}
