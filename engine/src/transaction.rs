//! Optimistic transactions.
//!
//! A [`Transaction`] stages pending mutations across one or more collections.
//! While it is active, its mutations form part of each collection's
//! optimistic overlay. Committing runs the transaction's mutation function
//! and either completes it (the overlay entries are dropped once the state
//! change is observed) or rolls it back.
//!
//! ## States
//!
//! ```text
//! pending -> executing -> completed
//!    |           |
//!    |           +-----> failed
//!    +-> persisting <-> executing        (driven by an external queue)
//! ```

use crate::{
    error::Result, mutation::merge_pending_mutations, Error, ExecutionError, GlobalKey, Key,
    PendingMutation, TransactionId,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    /// Accepting mutations.
    Pending,
    /// Durably queued for execution; no longer accepts mutations.
    Persisting,
    /// The mutation function is running.
    Executing,
    Completed,
    Failed,
}

impl TransactionState {
    /// Whether the transaction still contributes to the optimistic overlay.
    pub fn is_active(&self) -> bool {
        !matches!(self, TransactionState::Completed | TransactionState::Failed)
    }
}

/// Arguments handed to a mutation function.
#[derive(Clone)]
pub struct MutationFnParams {
    pub transaction: Transaction,
}

/// Remote execution function run when a transaction commits.
pub type MutationFn = Arc<
    dyn Fn(MutationFnParams) -> BoxFuture<'static, std::result::Result<(), ExecutionError>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`MutationFn`].
pub fn mutation_fn<F, Fut>(f: F) -> MutationFn
where
    F: Fn(MutationFnParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), ExecutionError>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(f(params)))
}

/// Receives state changes of transactions touching a collection.
pub(crate) trait TransactionObserver: Send + Sync {
    fn observer_id(&self) -> &str;

    /// Called after the transaction changed state, outside of any transaction lock.
    fn transaction_state_changed(&self, transaction: &Transaction);

    /// Pending transactions, other than `except`, that mutate any of `keys`.
    fn pending_transactions_touching(&self, keys: &HashSet<Key>, except: &str)
        -> Vec<Transaction>;
}

/// Options for creating a transaction.
#[derive(Clone)]
pub struct TransactionConfig {
    pub id: Option<TransactionId>,
    /// Commit automatically after [`Transaction::mutate`].
    pub auto_commit: bool,
    pub metadata: Option<Value>,
    pub mutation_fn: Option<MutationFn>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            id: None,
            auto_commit: true,
            metadata: None,
            mutation_fn: None,
        }
    }
}

impl TransactionConfig {
    pub fn with_id(mut self, id: impl Into<TransactionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Require an explicit [`Transaction::commit`].
    pub fn manual(mut self) -> Self {
        self.auto_commit = false;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_mutation_fn(mut self, f: MutationFn) -> Self {
        self.mutation_fn = Some(f);
        self
    }
}

struct Shared {
    state: TransactionState,
    mutations: Vec<PendingMutation>,
    error: Option<Error>,
    observers: Vec<Weak<dyn TransactionObserver>>,
}

struct Inner {
    id: TransactionId,
    auto_commit: bool,
    created_at: DateTime<Utc>,
    metadata: Option<Value>,
    mutation_fn: Option<MutationFn>,
    shared: Mutex<Shared>,
    settled: watch::Sender<Option<Result<()>>>,
}

/// Handle to a transaction. Clones share the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Transaction {
    /// Create a new pending transaction.
    pub fn new(config: TransactionConfig) -> Self {
        let (settled, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                id: config
                    .id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                auto_commit: config.auto_commit,
                created_at: Utc::now(),
                metadata: config.metadata,
                mutation_fn: config.mutation_fn,
                shared: Mutex::new(Shared {
                    state: TransactionState::Pending,
                    mutations: Vec::new(),
                    error: None,
                    observers: Vec::new(),
                }),
                settled,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.shared.lock().state
    }

    pub fn auto_commit(&self) -> bool {
        self.inner.auto_commit
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.inner.metadata.as_ref()
    }

    /// Snapshot of the staged mutations, in first-touch order.
    pub fn mutations(&self) -> Vec<PendingMutation> {
        self.inner.shared.lock().mutations.clone()
    }

    /// The error that failed this transaction, if any.
    pub fn error(&self) -> Option<Error> {
        self.inner.shared.lock().error.clone()
    }

    /// Keys of the given collection this transaction mutates.
    pub fn keys_for(&self, collection_id: &str) -> HashSet<Key> {
        self.inner
            .shared
            .lock()
            .mutations
            .iter()
            .filter(|m| m.collection_id == collection_id)
            .map(|m| m.key.clone())
            .collect()
    }

    /// Run `f` to stage mutations, then commit if the transaction auto-commits.
    ///
    /// Auto-commit runs on the current Tokio runtime.
    pub fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Transaction) -> Result<()>,
    {
        self.ensure_pending()?;
        f(self)?;
        if self.inner.auto_commit {
            self.spawn_commit()?;
        }
        Ok(())
    }

    /// Merge mutations into the transaction, collapsing repeated keys.
    ///
    /// All or nothing: when any mutation cannot be merged the staged
    /// mutations are left as they were.
    pub fn apply_mutations(&self, incoming: Vec<PendingMutation>) -> Result<()> {
        let mut shared = self.inner.shared.lock();
        if shared.state != TransactionState::Pending {
            return Err(Error::TransactionNotPending(self.inner.id.clone()));
        }

        let mut staged = shared.mutations.clone();
        for mut mutation in incoming {
            mutation.transaction_id = self.inner.id.clone();
            let global_key = mutation.global_key();
            let position = staged.iter().position(|m| m.global_key() == global_key);

            match position {
                None => staged.push(mutation),
                Some(i) => match merge_pending_mutations(&staged[i], mutation)? {
                    Some(merged) => staged[i] = merged,
                    None => {
                        staged.remove(i);
                    }
                },
            }
        }
        shared.mutations = staged;
        Ok(())
    }

    /// Whether the transaction touches `key`.
    pub fn touches(&self, key: &GlobalKey) -> bool {
        self.inner
            .shared
            .lock()
            .mutations
            .iter()
            .any(|m| &m.global_key() == key)
    }

    /// Commit: run the mutation function and settle the transaction.
    ///
    /// A transaction without a mutation function completes locally.
    pub async fn commit(&self) -> Result<()> {
        let empty = {
            let mut shared = self.inner.shared.lock();
            if shared.state != TransactionState::Pending {
                return Err(Error::TransactionNotPending(self.inner.id.clone()));
            }
            let empty = shared.mutations.is_empty();
            if !empty {
                shared.state = TransactionState::Executing;
            }
            empty
        };

        let Some(mutation_fn) = self.inner.mutation_fn.clone().filter(|_| !empty) else {
            return self.complete();
        };

        tracing::debug!(transaction_id = %self.inner.id, "executing transaction");
        let result = mutation_fn(MutationFnParams {
            transaction: self.clone(),
        })
        .await;

        match result {
            Ok(()) => self.complete(),
            Err(e) => {
                let error = Error::Execution(e);
                tracing::warn!(transaction_id = %self.inner.id, error = %error, "transaction failed");
                self.rollback_with(error.clone(), true);
                Err(error)
            }
        }
    }

    /// Spawn [`Transaction::commit`] on the current Tokio runtime.
    pub fn spawn_commit(&self) -> Result<()> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?;
        let tx = self.clone();
        handle.spawn(async move {
            if let Err(e) = tx.commit().await {
                tracing::debug!(transaction_id = %tx.id(), error = %e, "auto-commit finished with error");
            }
        });
        Ok(())
    }

    /// Roll back a transaction that has not completed.
    ///
    /// Pending transactions touching the same keys are rolled back as well.
    pub fn rollback(&self) -> Result<()> {
        match self.state() {
            TransactionState::Completed => {
                Err(Error::TransactionAlreadyCompleted(self.inner.id.clone()))
            }
            TransactionState::Failed => Ok(()),
            _ => {
                self.rollback_with(Error::TransactionRolledBack(self.inner.id.clone()), true);
                Ok(())
            }
        }
    }

    /// Mark the transaction as durably queued.
    pub fn mark_persisting(&self) -> Result<()> {
        self.transition(TransactionState::Persisting)
    }

    /// Mark the transaction as currently executing.
    pub fn mark_executing(&self) -> Result<()> {
        self.transition(TransactionState::Executing)
    }

    /// Complete the transaction after successful remote execution.
    pub fn complete(&self) -> Result<()> {
        {
            let mut shared = self.inner.shared.lock();
            if !shared.state.is_active() {
                return Err(Error::TransactionNotPending(self.inner.id.clone()));
            }
            shared.state = TransactionState::Completed;
        }
        tracing::debug!(transaction_id = %self.inner.id, "transaction completed");
        self.notify_observers();
        self.inner.settled.send_replace(Some(Ok(())));
        Ok(())
    }

    /// Fail the transaction with `error`, rolling back its optimistic state.
    pub fn fail(&self, error: Error) -> Result<()> {
        if !self.state().is_active() {
            return Err(Error::TransactionNotPending(self.inner.id.clone()));
        }
        self.rollback_with(error, true);
        Ok(())
    }

    /// Resolves once the transaction completes or fails.
    pub async fn is_persisted(&self) -> Result<()> {
        let mut rx = self.inner.settled.subscribe();
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::TransactionRolledBack(self.inner.id.clone()))?;
        settled
            .clone()
            .unwrap_or_else(|| Err(Error::TransactionRolledBack(self.inner.id.clone())))
    }

    pub(crate) fn attach_observer(&self, observer: Weak<dyn TransactionObserver>) {
        let Some(strong) = observer.upgrade() else {
            return;
        };
        let mut shared = self.inner.shared.lock();
        let known = shared
            .observers
            .iter()
            .filter_map(Weak::upgrade)
            .any(|o| o.observer_id() == strong.observer_id());
        if !known {
            shared.observers.push(observer);
        }
    }

    pub(crate) fn ensure_pending(&self) -> Result<()> {
        if self.state() == TransactionState::Pending {
            Ok(())
        } else {
            Err(Error::TransactionNotPending(self.inner.id.clone()))
        }
    }

    fn transition(&self, next: TransactionState) -> Result<()> {
        let previous = {
            let mut shared = self.inner.shared.lock();
            let allowed = matches!(
                (shared.state, next),
                (TransactionState::Pending, TransactionState::Persisting)
                    | (TransactionState::Pending, TransactionState::Executing)
                    | (TransactionState::Persisting, TransactionState::Executing)
                    | (TransactionState::Executing, TransactionState::Persisting)
            );
            if !allowed {
                return Err(Error::TransactionNotPending(self.inner.id.clone()));
            }
            std::mem::replace(&mut shared.state, next)
        };
        if previous == TransactionState::Executing {
            self.notify_observers();
        }
        Ok(())
    }

    fn observers(&self) -> Vec<Arc<dyn TransactionObserver>> {
        self.inner
            .shared
            .lock()
            .observers
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn notify_observers(&self) {
        for observer in self.observers() {
            observer.transaction_state_changed(self);
        }
    }

    fn rollback_with(&self, error: Error, cascade: bool) {
        {
            let mut shared = self.inner.shared.lock();
            if !shared.state.is_active() {
                return;
            }
            shared.state = TransactionState::Failed;
            shared.error = Some(error.clone());
        }
        tracing::debug!(transaction_id = %self.inner.id, "transaction rolled back");

        if cascade {
            for observer in self.observers() {
                let keys = self.keys_for(observer.observer_id());
                if keys.is_empty() {
                    continue;
                }
                for other in observer.pending_transactions_touching(&keys, &self.inner.id) {
                    let other_id = other.id().to_string();
                    other.rollback_with(Error::TransactionRolledBack(other_id), false);
                }
            }
        }

        self.notify_observers();
        self.inner.settled.send_replace(Some(Err(error)));
    }
}
