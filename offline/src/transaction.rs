//! Transactions executed through the offline executor.

use crate::error::{OfflineError, Result};
use crate::executor::{Completion, OfflineExecutor};
use serde_json::Value;
use stowage_engine::{Collection, Key, Transaction, TransactionState};

/// Options for [`OfflineExecutor::create_offline_transaction`].
#[derive(Debug, Clone, Default)]
pub struct OfflineTransactionConfig {
    /// Registered mutation function that executes the transaction.
    pub mutation_fn_name: String,
    /// Defaults to a fresh UUID.
    pub idempotency_key: Option<String>,
    pub metadata: Option<Value>,
    /// Commit after each [`OfflineTransaction::mutate`].
    pub auto_commit: bool,
}

impl OfflineTransactionConfig {
    pub fn new(mutation_fn_name: impl Into<String>) -> Self {
        Self {
            mutation_fn_name: mutation_fn_name.into(),
            ..Default::default()
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn auto_commit(mut self) -> Self {
        self.auto_commit = true;
        self
    }
}

/// A transaction whose commit goes through the offline executor.
///
/// Mutations staged here show up in their collections immediately, exactly
/// like any other optimistic transaction.
#[derive(Debug, Clone)]
pub struct OfflineTransaction {
    executor: OfflineExecutor,
    transaction: Transaction,
    config: OfflineTransactionConfig,
    idempotency_key: String,
}

impl OfflineTransaction {
    pub(crate) fn new(
        executor: OfflineExecutor,
        transaction: Transaction,
        config: OfflineTransactionConfig,
    ) -> Self {
        let idempotency_key = config
            .idempotency_key
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            executor,
            transaction,
            config,
            idempotency_key,
        }
    }

    pub fn id(&self) -> &str {
        self.transaction.id()
    }

    /// The underlying engine transaction.
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn state(&self) -> TransactionState {
        self.transaction.state()
    }

    /// Stage mutations with `f`. Auto-committing transactions commit in the
    /// background afterwards.
    pub fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Transaction) -> stowage_engine::Result<()>,
    {
        f(&self.transaction)?;
        if self.config.auto_commit {
            let handle = tokio::runtime::Handle::try_current()
                .map_err(|_| stowage_engine::Error::RuntimeUnavailable)?;
            let this = self.clone();
            handle.spawn(async move {
                if let Err(e) = this.commit().await {
                    tracing::warn!(transaction_id = %this.id(), error = %e, "auto-commit failed");
                }
            });
        }
        Ok(())
    }

    pub fn insert(&self, collection: &Collection, item: Value) -> Result<()> {
        Ok(self.transaction.insert(collection, item)?)
    }

    pub fn update(
        &self,
        collection: &Collection,
        key: impl Into<Key>,
        f: impl FnOnce(&mut Value),
    ) -> Result<()> {
        Ok(self.transaction.update(collection, key, f)?)
    }

    pub fn delete(&self, collection: &Collection, key: impl Into<Key>) -> Result<()> {
        Ok(self.transaction.delete(collection, key)?)
    }

    /// Commit the transaction.
    ///
    /// When offline mode is enabled the transaction is durably queued before
    /// this returns; otherwise it starts executing right away. The returned
    /// [`Completion`] resolves once the mutation function finished.
    pub async fn commit(&self) -> Result<Completion> {
        self.executor
            .submit(&self.transaction, &self.config, &self.idempotency_key)
            .await
    }

    /// Discard the staged mutations.
    pub fn rollback(&self) -> Result<()> {
        self.transaction.rollback().map_err(OfflineError::from)
    }
}
