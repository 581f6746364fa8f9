//! Pending mutations and the per-key merge rules.
//!
//! A transaction never stores two mutations for the same key. When a new
//! mutation targets a key the transaction already touched, the pair is
//! collapsed with [`merge_pending_mutations`].

use crate::{error::Result, CollectionId, Error, GlobalKey, Key, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Type of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for MutationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationType::Insert => write!(f, "insert"),
            MutationType::Update => write!(f, "update"),
            MutationType::Delete => write!(f, "delete"),
        }
    }
}

/// One operation inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub mutation_id: String,
    #[serde(rename = "type")]
    pub mutation_type: MutationType,
    pub key: Key,
    pub collection_id: CollectionId,
    pub transaction_id: TransactionId,
    /// Pre-image; `None` for inserts.
    pub original: Option<Value>,
    /// Post-image; `None` for deletes.
    pub modified: Option<Value>,
    /// Top-level fields that differ between `original` and `modified`.
    pub changes: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Whether the mutation is applied to the optimistic overlay.
    pub optimistic: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingMutation {
    /// Create a mutation stamped with the current time.
    pub fn new(
        mutation_type: MutationType,
        collection_id: impl Into<CollectionId>,
        transaction_id: impl Into<TransactionId>,
        key: Key,
        original: Option<Value>,
        modified: Option<Value>,
    ) -> Self {
        let changes = match (&original, &modified) {
            (Some(o), Some(m)) => diff_top_level(o, m),
            (None, Some(m)) => m.clone(),
            _ => Value::Object(Map::new()),
        };
        let now = Utc::now();
        Self {
            mutation_id: uuid::Uuid::new_v4().to_string(),
            mutation_type,
            key,
            collection_id: collection_id.into(),
            transaction_id: transaction_id.into(),
            original,
            modified,
            changes,
            metadata: None,
            optimistic: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    pub fn global_key(&self) -> GlobalKey {
        GlobalKey::new(self.collection_id.clone(), self.key.clone())
    }
}

/// Object of top-level fields in `modified` whose value differs from `original`.
///
/// Fields removed in `modified` are reported as `null`.
pub fn diff_top_level(original: &Value, modified: &Value) -> Value {
    let (Some(before), Some(after)) = (original.as_object(), modified.as_object()) else {
        return if original == modified {
            Value::Object(Map::new())
        } else {
            modified.clone()
        };
    };

    let mut changes = Map::new();
    for (field, value) in after {
        if before.get(field) != Some(value) {
            changes.insert(field.clone(), value.clone());
        }
    }
    for field in before.keys() {
        if !after.contains_key(field) {
            changes.insert(field.clone(), Value::Null);
        }
    }
    Value::Object(changes)
}

fn merge_changes(first: &Value, second: &Value) -> Value {
    match (first, second) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (k, v) in b {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => second.clone(),
    }
}

/// Collapse `incoming` into `existing` for the same key.
///
/// Returns `Ok(None)` when the pair cancels out (insert followed by delete).
///
/// | existing | incoming | result |
/// |----------|----------|--------|
/// | insert   | update   | insert with the update's post-image, no pre-image |
/// | insert   | delete   | nothing |
/// | update   | update   | update keeping the first pre-image |
/// | update   | delete   | delete keeping the first pre-image |
///
/// Every other pairing is rejected.
pub fn merge_pending_mutations(
    existing: &PendingMutation,
    incoming: PendingMutation,
) -> Result<Option<PendingMutation>> {
    use MutationType::*;

    match (existing.mutation_type, incoming.mutation_type) {
        (Insert, Update) => Ok(Some(PendingMutation {
            mutation_type: Insert,
            original: None,
            changes: merge_changes(&existing.changes, &incoming.changes),
            mutation_id: existing.mutation_id.clone(),
            created_at: existing.created_at,
            ..incoming
        })),
        (Insert, Delete) => Ok(None),
        (Update, Update) => Ok(Some(PendingMutation {
            original: existing.original.clone(),
            changes: merge_changes(&existing.changes, &incoming.changes),
            mutation_id: existing.mutation_id.clone(),
            created_at: existing.created_at,
            ..incoming
        })),
        (Update, Delete) => Ok(Some(PendingMutation {
            original: existing.original.clone(),
            mutation_id: existing.mutation_id.clone(),
            created_at: existing.created_at,
            ..incoming
        })),
        (existing_type, incoming_type) => Err(Error::InvalidMutationSequence {
            key: incoming.key,
            existing: existing_type.to_string(),
            incoming: incoming_type.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn insert(key: &str, value: Value) -> PendingMutation {
        PendingMutation::new(MutationType::Insert, "todos", "tx-1", key.into(), None, Some(value))
    }

    fn update(key: &str, original: Value, modified: Value) -> PendingMutation {
        PendingMutation::new(
            MutationType::Update,
            "todos",
            "tx-1",
            key.into(),
            Some(original),
            Some(modified),
        )
    }

    fn delete(key: &str, original: Value) -> PendingMutation {
        PendingMutation::new(MutationType::Delete, "todos", "tx-1", key.into(), Some(original), None)
    }

    #[test]
    fn insert_then_update_stays_insert() {
        let first = insert("a", json!({"id": "a", "title": "draft"}));
        let second = update(
            "a",
            json!({"id": "a", "title": "draft"}),
            json!({"id": "a", "title": "final"}),
        );

        let merged = merge_pending_mutations(&first, second).unwrap().unwrap();
        assert_eq!(merged.mutation_type, MutationType::Insert);
        assert_eq!(merged.original, None);
        assert_eq!(merged.modified, Some(json!({"id": "a", "title": "final"})));
        assert_eq!(merged.mutation_id, first.mutation_id);
    }

    #[test]
    fn insert_then_delete_cancels() {
        let first = insert("a", json!({"id": "a"}));
        let merged = merge_pending_mutations(&first, delete("a", json!({"id": "a"}))).unwrap();
        assert!(merged.is_none());
    }

    #[test]
    fn update_then_update_keeps_first_original() {
        let first = update("a", json!({"n": 1}), json!({"n": 2}));
        let second = update("a", json!({"n": 2}), json!({"n": 3}));

        let merged = merge_pending_mutations(&first, second).unwrap().unwrap();
        assert_eq!(merged.mutation_type, MutationType::Update);
        assert_eq!(merged.original, Some(json!({"n": 1})));
        assert_eq!(merged.modified, Some(json!({"n": 3})));
        assert_eq!(merged.changes, json!({"n": 3}));
    }

    #[test]
    fn update_then_delete_becomes_delete() {
        let first = update("a", json!({"n": 1}), json!({"n": 2}));
        let merged = merge_pending_mutations(&first, delete("a", json!({"n": 2})))
            .unwrap()
            .unwrap();
        assert_eq!(merged.mutation_type, MutationType::Delete);
        assert_eq!(merged.original, Some(json!({"n": 1})));
        assert_eq!(merged.modified, None);
    }

    #[test]
    fn illegal_sequences_are_rejected() {
        let del = delete("a", json!({"n": 1}));
        let err = merge_pending_mutations(&del, insert("a", json!({"n": 1}))).unwrap_err();
        assert!(matches!(err, Error::InvalidMutationSequence { .. }));

        let ins = insert("a", json!({"n": 1}));
        assert!(merge_pending_mutations(&ins, insert("a", json!({"n": 2}))).is_err());
        assert!(merge_pending_mutations(&del, delete("a", json!({"n": 1}))).is_err());
    }

    #[test]
    fn diff_reports_changed_and_removed_fields() {
        let changes = diff_top_level(
            &json!({"a": 1, "b": 2, "c": 3}),
            &json!({"a": 1, "b": 5, "d": 4}),
        );
        assert_eq!(changes, json!({"b": 5, "d": 4, "c": null}));
    }

    #[test]
    fn serializes_with_type_tag() {
        let m = insert("a", json!({"id": "a"}));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["type"], "insert");
        assert_eq!(json["collectionId"], "todos");
        let parsed: PendingMutation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, m);
    }

    proptest! {
        #[test]
        fn update_chain_keeps_first_and_last_image(values in prop::collection::vec(0i64..100, 2..10)) {
            let images: Vec<Value> = values.iter().map(|n| json!({"id": "a", "n": n})).collect();
            let mut merged = update("a", images[0].clone(), images[1].clone());
            for pair in images[1..].windows(2) {
                merged = merge_pending_mutations(&merged, update("a", pair[0].clone(), pair[1].clone()))
                    .unwrap()
                    .unwrap();
            }

            prop_assert_eq!(merged.mutation_type, MutationType::Update);
            prop_assert_eq!(merged.original.as_ref(), images.first());
            prop_assert_eq!(merged.modified.as_ref(), images.last());
        }

        #[test]
        fn diff_of_identical_objects_is_empty(n in any::<i64>(), title in "[a-z]{0,8}") {
            let item = json!({"n": n, "title": title});
            prop_assert_eq!(diff_top_level(&item, &item), json!({}));
        }
    }
}
