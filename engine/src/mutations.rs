//! Insert, update and delete on a collection.
//!
//! Each call builds pending mutations against the visible state and stages
//! them in a transaction. Without an ambient transaction a new one is
//! created around the collection's handler for that operation and committed
//! in the background; the returned transaction can be awaited with
//! [`Transaction::is_persisted`].

use crate::collection::Collection;
use crate::mutation::diff_top_level;
use crate::transaction::{MutationFn, TransactionConfig};
use crate::{
    error::Result, Error, Key, MutationType, PendingMutation, Transaction, TransactionState,
};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Options for a single mutating call.
#[derive(Debug, Clone)]
pub struct OperationConfig {
    /// Stage the mutations in this transaction instead of a new one.
    pub transaction: Option<Transaction>,
    /// Show the mutations in the overlay before they are confirmed.
    pub optimistic: bool,
    pub metadata: Option<Value>,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            transaction: None,
            optimistic: true,
            metadata: None,
        }
    }
}

impl OperationConfig {
    pub fn in_transaction(transaction: &Transaction) -> Self {
        Self {
            transaction: Some(transaction.clone()),
            ..Self::default()
        }
    }

    pub fn non_optimistic(mut self) -> Self {
        self.optimistic = false;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl Collection {
    pub fn insert(&self, item: Value) -> Result<Transaction> {
        self.insert_many_with(vec![item], OperationConfig::default())
    }

    pub fn insert_many(&self, items: Vec<Value>) -> Result<Transaction> {
        self.insert_many_with(items, OperationConfig::default())
    }

    pub fn insert_with(&self, item: Value, config: OperationConfig) -> Result<Transaction> {
        self.insert_many_with(vec![item], config)
    }

    /// Insert `items`. Every item is validated and keyed before anything is
    /// staged, so a failure leaves the collection untouched.
    pub fn insert_many_with(&self, items: Vec<Value>, config: OperationConfig) -> Result<Transaction> {
        let handler = self.prepare("insert", &config)?;
        let _turn = self.turn();

        let mut seen = HashSet::new();
        let mut mutations = Vec::with_capacity(items.len());
        for item in items {
            let item = self.validate("insert", &item)?;
            let key = (self.inner.key_fn)(&item)
                .ok_or_else(|| Error::UndefinedKey(item.to_string()))?;
            if self.has(&key) || !seen.insert(key.clone()) {
                return Err(Error::DuplicateKey(key));
            }
            mutations.push(self.mutation(MutationType::Insert, key, None, Some(item), &config));
        }
        self.stage(mutations, config, handler)
    }

    pub fn update(&self, key: impl Into<Key>, f: impl FnOnce(&mut Value)) -> Result<Transaction> {
        self.update_with(key, OperationConfig::default(), f)
    }

    /// Update one item through a draft. An unchanged draft stages nothing.
    pub fn update_with(
        &self,
        key: impl Into<Key>,
        config: OperationConfig,
        f: impl FnOnce(&mut Value),
    ) -> Result<Transaction> {
        self.update_many_with(vec![key.into()], config, |drafts| {
            if let Some(draft) = drafts.first_mut() {
                f(draft);
            }
        })
    }

    pub fn update_many(&self, keys: Vec<Key>, f: impl FnOnce(&mut [Value])) -> Result<Transaction> {
        self.update_many_with(keys, OperationConfig::default(), f)
    }

    /// Update several items at once. `f` receives the drafts in `keys` order.
    pub fn update_many_with(
        &self,
        keys: Vec<Key>,
        config: OperationConfig,
        f: impl FnOnce(&mut [Value]),
    ) -> Result<Transaction> {
        let handler = self.prepare("update", &config)?;
        let _turn = self.turn();

        let mut originals = Vec::with_capacity(keys.len());
        for key in &keys {
            let original = self.get(key).ok_or_else(|| Error::KeyNotFound {
                operation: "update".into(),
                key: key.clone(),
            })?;
            originals.push(original);
        }

        let mut drafts = originals.clone();
        f(&mut drafts);

        let mut mutations = Vec::new();
        for ((key, original), draft) in keys.into_iter().zip(originals).zip(drafts) {
            if is_empty_object(&diff_top_level(&original, &draft)) {
                continue;
            }
            let modified = self.validate("update", &draft)?;
            if let Some(new_key) = (self.inner.key_fn)(&modified) {
                if new_key != key {
                    return Err(Error::KeyUpdateNotAllowed {
                        from: key,
                        to: new_key,
                    });
                }
            }
            mutations.push(self.mutation(
                MutationType::Update,
                key,
                Some(original),
                Some(modified),
                &config,
            ));
        }

        if mutations.is_empty() {
            tracing::debug!(collection = %self.id(), "update produced no changes");
            return Ok(config.transaction.unwrap_or_else(settled_transaction));
        }
        self.stage(mutations, config, handler)
    }

    pub fn delete(&self, key: impl Into<Key>) -> Result<Transaction> {
        self.delete_many_with(vec![key.into()], OperationConfig::default())
    }

    pub fn delete_many(&self, keys: Vec<Key>) -> Result<Transaction> {
        self.delete_many_with(keys, OperationConfig::default())
    }

    pub fn delete_with(&self, key: impl Into<Key>, config: OperationConfig) -> Result<Transaction> {
        self.delete_many_with(vec![key.into()], config)
    }

    pub fn delete_many_with(&self, keys: Vec<Key>, config: OperationConfig) -> Result<Transaction> {
        let handler = self.prepare("delete", &config)?;
        let _turn = self.turn();

        let mut seen = HashSet::new();
        let mut mutations = Vec::with_capacity(keys.len());
        for key in keys {
            if !seen.insert(key.clone()) {
                return Err(Error::InvalidMutationSequence {
                    key,
                    existing: MutationType::Delete.to_string(),
                    incoming: MutationType::Delete.to_string(),
                });
            }
            let original = self.get(&key).ok_or_else(|| Error::KeyNotFound {
                operation: "delete".into(),
                key: key.clone(),
            })?;
            mutations.push(self.mutation(MutationType::Delete, key, Some(original), None, &config));
        }
        self.stage(mutations, config, handler)
    }

    /// Checks shared by every operation, run before any state changes.
    fn prepare(&self, operation: &str, config: &OperationConfig) -> Result<Option<MutationFn>> {
        self.inner.validate_usable()?;

        if let Some(transaction) = &config.transaction {
            transaction.ensure_pending()?;
            return Ok(None);
        }

        let handler = match operation {
            "insert" => self.inner.config.on_insert.clone(),
            "update" => self.inner.config.on_update.clone(),
            _ => self.inner.config.on_delete.clone(),
        }
        .ok_or_else(|| Error::MissingHandler {
            collection: self.id().to_string(),
            operation: operation.to_string(),
        })?;
        tokio::runtime::Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?;
        Ok(Some(handler))
    }

    fn validate(&self, operation: &str, candidate: &Value) -> Result<Value> {
        match &self.inner.config.schema {
            Some(schema) => schema
                .validate(candidate)
                .map_err(|issues| Error::SchemaValidation {
                    operation: operation.to_string(),
                    issues,
                }),
            None => Ok(candidate.clone()),
        }
    }

    fn mutation(
        &self,
        kind: MutationType,
        key: Key,
        original: Option<Value>,
        modified: Option<Value>,
        config: &OperationConfig,
    ) -> PendingMutation {
        PendingMutation::new(kind, self.id(), "", key, original, modified)
            .with_metadata(config.metadata.clone())
            .with_optimistic(config.optimistic)
    }

    fn stage(
        &self,
        mutations: Vec<PendingMutation>,
        config: OperationConfig,
        handler: Option<MutationFn>,
    ) -> Result<Transaction> {
        if mutations.is_empty() {
            return Ok(config.transaction.unwrap_or_else(settled_transaction));
        }

        let (transaction, direct) = match (config.transaction, handler) {
            (Some(ambient), _) => (ambient, false),
            (None, Some(handler)) => (
                Transaction::new(TransactionConfig::default().with_mutation_fn(handler)),
                true,
            ),
            (None, None) => (Transaction::new(TransactionConfig::default()), true),
        };

        transaction.apply_mutations(mutations)?;
        self.attach_transaction(&transaction)?;
        if direct {
            transaction.spawn_commit()?;
        }
        Ok(transaction)
    }
}

impl Transaction {
    /// Stage an insert into `collection` in this transaction.
    pub fn insert(&self, collection: &Collection, item: Value) -> Result<()> {
        collection
            .insert_with(item, OperationConfig::in_transaction(self))
            .map(|_| ())
    }

    /// Stage an update of `key` in `collection` in this transaction.
    pub fn update(
        &self,
        collection: &Collection,
        key: impl Into<Key>,
        f: impl FnOnce(&mut Value),
    ) -> Result<()> {
        collection
            .update_with(key, OperationConfig::in_transaction(self), f)
            .map(|_| ())
    }

    /// Stage a delete of `key` in `collection` in this transaction.
    pub fn delete(&self, collection: &Collection, key: impl Into<Key>) -> Result<()> {
        collection
            .delete_with(key, OperationConfig::in_transaction(self))
            .map(|_| ())
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(Map::is_empty)
}

/// A transaction with nothing to do, already completed.
fn settled_transaction() -> Transaction {
    let transaction = Transaction::new(TransactionConfig::default().manual());
    if let Err(e) = transaction.complete() {
        tracing::warn!(error = %e, "could not settle empty transaction");
    }
    debug_assert_eq!(transaction.state(), TransactionState::Completed);
    transaction
}
