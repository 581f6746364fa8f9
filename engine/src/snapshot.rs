//! Snapshot types for persisting and restoring collection state.
//!
//! A snapshot holds the synced rows of one collection, never the optimistic
//! overlay. Rows are kept in key order so serialization is deterministic.

use crate::{error::Result, CollectionId, Error, Key};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// One row of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: Key,
    pub value: Value,
}

/// A point-in-time copy of a collection's synced state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSnapshot {
    pub format_version: u32,
    pub collection_id: CollectionId,
    pub exported_at: DateTime<Utc>,
    /// Rows in key order
    pub items: Vec<SnapshotEntry>,
}

impl CollectionSnapshot {
    pub fn new(collection_id: impl Into<CollectionId>, items: BTreeMap<Key, Value>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            collection_id: collection_id.into(),
            exported_at: Utc::now(),
            items: items
                .into_iter()
                .map(|(key, value)| SnapshotEntry { key, value })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.items.iter().find(|e| &e.key == key).map(|e| &e.value)
    }

    /// Check that the snapshot can be imported into `collection_id`.
    pub fn validate_for(&self, collection_id: &str) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported format version {} (expected {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        if self.collection_id != collection_id {
            return Err(Error::InvalidSnapshot(format!(
                "snapshot of {} cannot be imported into {}",
                self.collection_id, collection_id
            )));
        }
        let mut previous: Option<&Key> = None;
        for entry in &self.items {
            if previous.is_some_and(|p| p >= &entry.key) {
                return Err(Error::InvalidSnapshot(format!(
                    "keys out of order or duplicated at {}",
                    entry.key
                )));
            }
            previous = Some(&entry.key);
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> CollectionSnapshot {
        let mut items = BTreeMap::new();
        items.insert(Key::Int(2), json!({"id": 2}));
        items.insert(Key::from("a"), json!({"id": "a"}));
        items.insert(Key::Int(1), json!({"id": 1}));
        CollectionSnapshot::new("todos", items)
    }

    #[test]
    fn json_keeps_key_types_and_order() {
        let snap = snapshot();
        let json = snap.to_json().unwrap();
        let restored = CollectionSnapshot::from_json(&json).unwrap();

        assert_eq!(restored, snap);
        let keys: Vec<_> = restored.items.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec![Key::Int(1), Key::Int(2), Key::from("a")]);
        assert!(json.contains("\"formatVersion\":1"));
    }

    #[test]
    fn validation() {
        let snap = snapshot();
        assert!(snap.validate_for("todos").is_ok());
        assert!(matches!(
            snap.validate_for("users"),
            Err(Error::InvalidSnapshot(_))
        ));

        let mut future = snap.clone();
        future.format_version = 99;
        assert!(future.validate_for("todos").is_err());

        let mut shuffled = snap;
        shuffled.items.reverse();
        assert!(shuffled.validate_for("todos").is_err());
    }

    #[test]
    fn invalid_json_is_reported() {
        assert!(matches!(
            CollectionSnapshot::from_json("{not json"),
            Err(Error::InvalidSnapshot(_))
        ));
    }
}
