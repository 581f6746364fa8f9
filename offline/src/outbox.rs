//! Outbox entries and their persistence.

use crate::error::StorageError;
use crate::storage::StorageAdapter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use stowage_engine::{ExecutionError, PendingMutation};

/// A committed transaction waiting for remote execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Id of the transaction.
    pub id: String,
    /// Name of the registered mutation function that executes the entry.
    pub mutation_fn_name: String,
    pub mutations: Vec<PendingMutation>,
    /// Global keys touched by the mutations.
    pub keys: Vec<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    /// Position in commit order.
    pub sequence: u64,
    pub retry_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl OutboxEntry {
    pub fn new(
        id: impl Into<String>,
        mutation_fn_name: impl Into<String>,
        mutations: Vec<PendingMutation>,
        idempotency_key: impl Into<String>,
        sequence: u64,
    ) -> Self {
        let now = Utc::now();
        let keys = mutations
            .iter()
            .map(|m| m.global_key().to_string())
            .collect();
        Self {
            id: id.into(),
            mutation_fn_name: mutation_fn_name.into(),
            mutations,
            keys,
            idempotency_key: idempotency_key.into(),
            created_at: now,
            sequence,
            retry_count: 0,
            next_attempt_at: now,
            last_error: None,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Ids of the collections the entry mutates, in first-touch order.
    pub fn collection_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for mutation in &self.mutations {
            if !ids.contains(&mutation.collection_id.as_str()) {
                ids.push(&mutation.collection_id);
            }
        }
        ids
    }
}

/// Typed access to outbox entries in a [`StorageAdapter`].
#[derive(Clone)]
pub struct Outbox {
    storage: Arc<dyn StorageAdapter>,
}

impl Outbox {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    /// Store or replace an entry.
    pub async fn put(&self, entry: &OutboxEntry) -> Result<(), StorageError> {
        let document = serde_json::to_string(entry).map_err(|e| StorageError::Corrupt {
            key: entry.id.clone(),
            message: e.to_string(),
        })?;
        self.storage.put(&entry.id, &document).await
    }

    pub async fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.storage.delete(id).await
    }

    /// All entries in sequence order. Undecodable documents are skipped.
    pub async fn list(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        let mut entries: Vec<OutboxEntry> = Vec::new();
        for (key, document) in self.storage.list().await? {
            match serde_json::from_str::<OutboxEntry>(&document) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping undecodable outbox entry");
                }
            }
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.storage.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use stowage_engine::{Key, MutationType};

    fn mutation(collection: &str, key: i64) -> PendingMutation {
        PendingMutation::new(
            MutationType::Insert,
            collection,
            "tx",
            Key::Int(key),
            None,
            Some(json!({"id": key})),
        )
    }

    #[test]
    fn entry_serializes_camel_case() {
        let entry = OutboxEntry::new("tx-1", "sync_todos", vec![mutation("todos", 1)], "idem", 3);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["mutationFnName"], "sync_todos");
        assert_eq!(value["idempotencyKey"], "idem");
        assert_eq!(value["retryCount"], 0);
        assert_eq!(value["keys"], json!(["KEY::todos/1"]));
        assert!(value.get("lastError").is_none());
    }

    #[test]
    fn collection_ids_are_unique() {
        let entry = OutboxEntry::new(
            "tx",
            "f",
            vec![mutation("todos", 1), mutation("tags", 1), mutation("todos", 2)],
            "k",
            0,
        );
        assert_eq!(entry.collection_ids(), vec!["todos", "tags"]);
    }

    #[tokio::test]
    async fn list_orders_by_sequence_and_skips_garbage() {
        let storage = MemoryStorage::new();
        let outbox = Outbox::new(Arc::new(storage.clone()));

        outbox.put(&OutboxEntry::new("a", "f", vec![], "k1", 2)).await.unwrap();
        outbox.put(&OutboxEntry::new("b", "f", vec![], "k2", 1)).await.unwrap();
        storage.put("c", "not json").await.unwrap();

        let ids: Vec<String> = outbox.list().await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b", "a"]);

        outbox.remove("b").await.unwrap();
        assert_eq!(outbox.list().await.unwrap().len(), 1);
    }
}
