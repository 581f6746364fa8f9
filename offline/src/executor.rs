//! The offline executor.
//!
//! Committed transactions are written to the outbox before `commit`
//! returns, then executed one at a time in commit order by a background
//! drain loop. Retriable failures keep the entry and its optimistic state
//! and back off; permanent failures drop the entry and roll the
//! transaction back.
//!
//! ```text
//! commit -> persisted -> executing -> completed
//!                           |    \-> rolled back
//!                           +-> retry wait -> executing
//! ```

use crate::config::{MutationFnParams, OfflineConfig, StorageChoice};
use crate::error::{OfflineError, Result};
use crate::outbox::{Outbox, OutboxEntry};
use crate::storage::StorageDiagnostic;
use crate::transaction::{OfflineTransaction, OfflineTransactionConfig};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use stowage_engine::{Error as EngineError, ExecutionError, Transaction, TransactionConfig};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Whether the executor can persist transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OfflineMode {
    /// Storage is available; the leader queues transactions durably.
    Offline,
    /// No usable storage; every transaction executes directly.
    OnlineOnly,
}

type Waiter = oneshot::Sender<Result<Value>>;

/// Resolves when a committed transaction has been executed remotely.
#[derive(Debug)]
pub struct Completion {
    id: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl Completion {
    fn channel(id: &str) -> (Waiter, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                id: id.to_string(),
                rx,
            },
        )
    }

    fn resolved(id: &str, result: Result<Value>) -> Self {
        let (tx, completion) = Self::channel(id);
        let _ = tx.send(result);
        completion
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The mutation function's result, or the error that ended the transaction.
    pub async fn wait(self) -> Result<Value> {
        self.rx.await.unwrap_or(Err(OfflineError::Disposed))
    }
}

enum Step {
    Idle,
    Wait(Duration),
    Run(OutboxEntry),
    Stop,
}

struct ExecutorInner {
    config: OfflineConfig,
    mode: OfflineMode,
    diagnostic: StorageDiagnostic,
    outbox: Option<Outbox>,
    is_leader: AtomicBool,
    disposed: AtomicBool,
    /// Entries awaiting execution, in sequence order.
    queue: Mutex<VecDeque<OutboxEntry>>,
    /// Live transactions by id, for queued entries and direct executions.
    transactions: DashMap<String, Transaction>,
    waiters: DashMap<String, Vec<Waiter>>,
    sequence: AtomicU64,
    /// Held from sequence assignment until the entry is queued, so the
    /// queue order matches the sequence order.
    persisting: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
    replaying: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Durable, leader-coordinated execution queue. Clones share one executor.
#[derive(Clone)]
pub struct OfflineExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for OfflineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineExecutor")
            .field("mode", &self.inner.mode)
            .field("is_leader", &self.is_leader())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl OfflineExecutor {
    /// Probe storage, request leadership and, when leading, replay the outbox.
    ///
    /// Restored transactions are visible in their collections when this returns.
    pub async fn start(config: OfflineConfig) -> Result<Self> {
        let span = tracing::info_span!("offline.initialize");
        Self::initialize(config).instrument(span).await
    }

    async fn initialize(config: OfflineConfig) -> Result<Self> {
        let (outbox, mode, diagnostic) = match &config.storage {
            StorageChoice::Trusted(storage) => (
                Some(Outbox::new(storage.clone())),
                OfflineMode::Offline,
                StorageDiagnostic::available("using custom storage adapter"),
            ),
            StorageChoice::Probed(storage) => match storage.probe().await {
                Ok(()) => (
                    Some(Outbox::new(storage.clone())),
                    OfflineMode::Offline,
                    StorageDiagnostic::available("storage probe succeeded"),
                ),
                Err(e) => {
                    let diagnostic = StorageDiagnostic::from_probe_error(&e);
                    tracing::warn!(code = ?diagnostic.code, error = %e, "storage unavailable");
                    (None, OfflineMode::OnlineOnly, diagnostic)
                }
            },
        };

        if mode == OfflineMode::OnlineOnly {
            if let Some(callback) = &config.on_storage_failure {
                callback(&diagnostic);
            }
        }

        let inner = Arc::new(ExecutorInner {
            config,
            mode,
            diagnostic,
            outbox,
            is_leader: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            transactions: DashMap::new(),
            waiters: DashMap::new(),
            sequence: AtomicU64::new(0),
            persisting: tokio::sync::Mutex::new(()),
            wake: Arc::new(Notify::new()),
            replaying: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        });

        if mode == OfflineMode::Offline {
            let election = inner.config.leader_election.clone();
            let leadership = election.subscribe();
            let leader = election.request_leadership().await;
            inner.set_leader(leader, true).await;

            let weak = Arc::downgrade(&inner);
            let tasks = vec![
                tokio::spawn(drain_loop(weak.clone(), inner.wake.clone())),
                tokio::spawn(watch_leadership(weak.clone(), leadership)),
                tokio::spawn(watch_connectivity(
                    weak,
                    inner.config.online_detector.subscribe(),
                )),
            ];
            inner.tasks.lock().extend(tasks);
        }

        tracing::info!(mode = ?mode, leader = inner.is_leader.load(Ordering::SeqCst), "offline executor started");
        Ok(Self { inner })
    }

    /// Create a transaction executed by the named mutation function.
    pub fn create_offline_transaction(
        &self,
        config: OfflineTransactionConfig,
    ) -> Result<OfflineTransaction> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(OfflineError::Disposed);
        }
        if !self.inner.config.mutation_fns.contains_key(&config.mutation_fn_name) {
            return Err(OfflineError::UnknownMutationFn(config.mutation_fn_name));
        }

        let mut tx_config = TransactionConfig::default().manual();
        if let Some(metadata) = &config.metadata {
            tx_config = tx_config.with_metadata(metadata.clone());
        }
        Ok(OfflineTransaction::new(
            self.clone(),
            Transaction::new(tx_config),
            config,
        ))
    }

    pub fn mode(&self) -> OfflineMode {
        self.inner.mode
    }

    pub fn storage_diagnostic(&self) -> &StorageDiagnostic {
        &self.inner.diagnostic
    }

    /// Whether commits currently go through the outbox.
    pub fn is_offline_enabled(&self) -> bool {
        self.inner.is_offline_enabled()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::SeqCst)
    }

    /// Number of queued entries not yet executed.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Entries currently persisted in the outbox.
    pub async fn peek_outbox(&self) -> Result<Vec<OutboxEntry>> {
        match &self.inner.outbox {
            Some(outbox) => Ok(outbox.list().await?),
            None => Ok(Vec::new()),
        }
    }

    /// Drop every queued entry and roll back its transaction.
    pub async fn clear_outbox(&self) -> Result<()> {
        let Some(outbox) = &self.inner.outbox else {
            return Ok(());
        };
        outbox.clear().await?;

        let cleared: Vec<OutboxEntry> = self.inner.queue.lock().drain(..).collect();
        for entry in &cleared {
            if let Some((_, transaction)) = self.inner.transactions.remove(&entry.id) {
                if let Err(e) = transaction.rollback() {
                    tracing::debug!(transaction_id = %entry.id, error = %e, "rollback of cleared entry failed");
                }
            }
            self.inner.resolve(
                &entry.id,
                Err(EngineError::TransactionRolledBack(entry.id.clone()).into()),
            );
        }
        tracing::info!(count = cleared.len(), "outbox cleared");
        Ok(())
    }

    /// Wait until the transaction `id` finishes executing.
    pub async fn wait_for_transaction_completion(&self, id: &str) -> Result<Value> {
        let completion = {
            let Some(_tracked) = self.inner.transactions.get(id) else {
                return Err(OfflineError::TransactionNotFound(id.to_string()));
            };
            self.inner.register_waiter(id)
        };
        completion.wait().await
    }

    /// Signal that connectivity returned; pending entries are retried at once.
    pub fn notify_online(&self) {
        self.inner.config.online_detector.notify_online();
    }

    /// Stop draining, release leadership and reject all waiters.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if self.inner.mode == OfflineMode::Offline {
            self.inner.config.leader_election.release_leadership().await;
        }
        self.inner.is_leader.store(false, Ordering::SeqCst);

        let ids: Vec<String> = self.inner.waiters.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.inner.resolve(&id, Err(OfflineError::Disposed));
        }
        tracing::info!("offline executor disposed");
    }

    /// Commit `transaction`: queue it durably when offline mode is enabled,
    /// otherwise execute it right away.
    pub(crate) async fn submit(
        &self,
        transaction: &Transaction,
        config: &OfflineTransactionConfig,
        idempotency_key: &str,
    ) -> Result<Completion> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(OfflineError::Disposed);
        }

        let id = transaction.id().to_string();
        let mutations = transaction.mutations();
        if mutations.is_empty() {
            transaction.commit().await?;
            return Ok(Completion::resolved(&id, Ok(Value::Null)));
        }

        let outbox = match &self.inner.outbox {
            Some(outbox) if self.inner.is_offline_enabled() => outbox.clone(),
            _ => return self.execute_directly(transaction, config, idempotency_key),
        };

        let entry = OutboxEntry::new(
            &id,
            &config.mutation_fn_name,
            mutations,
            idempotency_key,
            0,
        )
        .with_metadata(config.metadata.clone());
        let span = tracing::info_span!("offline.persist", transaction_id = %id);
        self.persist(&outbox, transaction, entry).instrument(span).await
    }

    async fn persist(
        &self,
        outbox: &Outbox,
        transaction: &Transaction,
        mut entry: OutboxEntry,
    ) -> Result<Completion> {
        transaction.mark_persisting()?;
        let _order = self.inner.persisting.lock().await;
        entry.sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = outbox.put(&entry).await {
            tracing::error!(error = %e, "failed to persist transaction");
            if let Err(rollback) = transaction.rollback() {
                tracing::debug!(error = %rollback, "rollback after persist failure failed");
            }
            return Err(e.into());
        }

        self.inner
            .transactions
            .insert(entry.id.clone(), transaction.clone());
        let completion = self.inner.register_waiter(&entry.id);
        tracing::debug!(sequence = entry.sequence, "transaction persisted");
        self.inner.queue.lock().push_back(entry);
        self.inner.wake.notify_one();
        Ok(completion)
    }

    /// Run the mutation function now, bypassing the outbox.
    fn execute_directly(
        &self,
        transaction: &Transaction,
        config: &OfflineTransactionConfig,
        idempotency_key: &str,
    ) -> Result<Completion> {
        let mutation_fn = self
            .inner
            .config
            .mutation_fns
            .get(&config.mutation_fn_name)
            .cloned()
            .ok_or_else(|| OfflineError::UnknownMutationFn(config.mutation_fn_name.clone()))?;
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| EngineError::RuntimeUnavailable)?;

        transaction.mark_executing()?;
        let id = transaction.id().to_string();
        self.inner.transactions.insert(id.clone(), transaction.clone());
        let completion = self.inner.register_waiter(&id);

        let inner = self.inner.clone();
        let transaction = transaction.clone();
        let params = MutationFnParams {
            transaction: transaction.clone(),
            idempotency_key: idempotency_key.to_string(),
        };
        let span = tracing::info_span!("offline.execute", transaction_id = %id, attempt = 0u32);
        handle.spawn(
            async move {
                let result = mutation_fn(params).await;
                inner.transactions.remove(&id);
                match result {
                    Ok(value) => {
                        if let Err(e) = transaction.complete() {
                            tracing::debug!(error = %e, "transaction settled elsewhere");
                        }
                        inner.resolve(&id, Ok(value));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "direct execution failed");
                        if let Err(err) = transaction.fail(EngineError::Execution(e.clone())) {
                            tracing::debug!(error = %err, "transaction settled elsewhere");
                        }
                        inner.resolve(&id, Err(e.into()));
                    }
                }
            }
            .instrument(span),
        );
        Ok(completion)
    }
}

impl ExecutorInner {
    fn is_offline_enabled(&self) -> bool {
        self.mode == OfflineMode::Offline
            && self.config.offline_enabled
            && self.is_leader.load(Ordering::SeqCst)
            && !self.disposed.load(Ordering::SeqCst)
    }

    fn register_waiter(&self, id: &str) -> Completion {
        let (tx, completion) = Completion::channel(id);
        self.waiters.entry(id.to_string()).or_default().push(tx);
        completion
    }

    fn resolve(&self, id: &str, result: Result<Value>) {
        if let Some((_, waiters)) = self.waiters.remove(id) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    /// Apply a leadership state. The initial state is always reported.
    async fn set_leader(&self, leader: bool, initial: bool) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let was_leader = self.is_leader.swap(leader, Ordering::SeqCst);
        if was_leader == leader && !initial {
            return;
        }
        if let Some(callback) = &self.config.on_leadership_change {
            callback(leader);
        }

        if leader {
            tracing::info!("leadership gained");
            if let Err(e) = self.replay().await {
                tracing::warn!(error = %e, "failed to replay outbox");
            }
        } else if !initial {
            let dropped = {
                let mut queue = self.queue.lock();
                let dropped = queue.len();
                queue.clear();
                dropped
            };
            tracing::info!(dropped, "leadership lost, draining stopped");
        }
        self.wake.notify_one();
    }

    /// Load persisted entries, restore their optimistic state and queue them.
    async fn replay(&self) -> Result<usize> {
        let Some(outbox) = &self.outbox else {
            return Ok(0);
        };
        let _replaying = self.replaying.lock().await;

        let now = Utc::now();
        let mut restored = Vec::new();
        for mut entry in outbox.list().await? {
            if self.queue.lock().iter().any(|e| e.id == entry.id) {
                continue;
            }
            self.sequence.fetch_max(entry.sequence + 1, Ordering::SeqCst);
            entry.next_attempt_at = now;

            if !self.transactions.contains_key(&entry.id) {
                match self.restore(&entry) {
                    Ok(transaction) => {
                        self.transactions.insert(entry.id.clone(), transaction);
                    }
                    Err(e) => {
                        tracing::warn!(transaction_id = %entry.id, error = %e, "cannot restore queued transaction");
                        continue;
                    }
                }
            }
            restored.push(entry);
        }

        let count = restored.len();
        {
            let mut queue = self.queue.lock();
            queue.extend(restored);
            queue.make_contiguous().sort_by_key(|e| e.sequence);
        }
        tracing::info!(count, "outbox replayed");
        self.wake.notify_one();
        Ok(count)
    }

    /// Re-apply a persisted entry to its collections' optimistic state.
    fn restore(&self, entry: &OutboxEntry) -> stowage_engine::Result<Transaction> {
        let mut config = TransactionConfig::default()
            .with_id(entry.id.clone())
            .manual();
        if let Some(metadata) = &entry.metadata {
            config = config.with_metadata(metadata.clone());
        }

        let transaction = Transaction::new(config);
        transaction.apply_mutations(entry.mutations.clone())?;
        for collection_id in entry.collection_ids() {
            match self.config.collections.get(collection_id) {
                Some(collection) => collection.attach_transaction(&transaction)?,
                None => tracing::warn!(
                    collection = %collection_id,
                    transaction_id = %entry.id,
                    "queued mutation targets an unregistered collection"
                ),
            }
        }
        transaction.mark_persisting()?;
        Ok(transaction)
    }

    fn reset_retry_delays(&self) {
        let now = Utc::now();
        for entry in self.queue.lock().iter_mut() {
            entry.next_attempt_at = now;
        }
    }

    fn next_step(&self) -> Step {
        if self.disposed.load(Ordering::SeqCst) {
            return Step::Stop;
        }
        if !self.is_offline_enabled() || !self.config.online_detector.is_online() {
            return Step::Idle;
        }

        let queue = self.queue.lock();
        let Some(entry) = queue.front() else {
            return Step::Idle;
        };
        let now = Utc::now();
        if entry.next_attempt_at > now {
            let wait = (entry.next_attempt_at - now).to_std().unwrap_or(Duration::ZERO);
            Step::Wait(wait)
        } else {
            Step::Run(entry.clone())
        }
    }

    async fn execute(&self, entry: OutboxEntry) {
        let span = tracing::info_span!(
            "offline.execute",
            transaction_id = %entry.id,
            attempt = entry.retry_count
        );
        self.execute_entry(entry).instrument(span).await
    }

    async fn execute_entry(&self, entry: OutboxEntry) {
        let transaction = self.transactions.get(&entry.id).map(|t| t.value().clone());
        let Some(transaction) = transaction else {
            tracing::warn!("queued entry has no live transaction");
            self.forget(&entry.id).await;
            self.resolve(
                &entry.id,
                Err(OfflineError::TransactionNotFound(entry.id.clone())),
            );
            return;
        };

        let Some(mutation_fn) = self.config.mutation_fns.get(&entry.mutation_fn_name).cloned()
        else {
            tracing::error!(mutation_fn = %entry.mutation_fn_name, "unknown mutation function");
            if let Some(callback) = &self.config.on_unknown_mutation_fn {
                callback(&entry.mutation_fn_name, &entry);
            }
            let error = OfflineError::UnknownMutationFn(entry.mutation_fn_name.clone());
            let cause = ExecutionError::non_retriable(error.to_string());
            self.finish_failed(&entry, &transaction, cause, error).await;
            return;
        };

        if let Err(e) = transaction.mark_executing() {
            tracing::debug!(error = %e, "transaction is not persisting");
        }
        let result = mutation_fn(MutationFnParams {
            transaction: transaction.clone(),
            idempotency_key: entry.idempotency_key.clone(),
        })
        .await;

        match result {
            Ok(value) => {
                self.forget(&entry.id).await;
                if let Err(e) = transaction.complete() {
                    tracing::debug!(error = %e, "transaction settled elsewhere");
                }
                self.resolve(&entry.id, Ok(value));
                tracing::debug!("transaction executed");
            }
            Err(e) if self.config.retry_policy.should_retry(&e, entry.retry_count) => {
                let delay = self.config.retry_policy.delay(entry.retry_count, &entry.id);
                let mut next = entry.clone();
                next.retry_count += 1;
                next.next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                next.last_error = Some(e.clone());
                tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "retriable failure");

                if let Some(outbox) = &self.outbox {
                    if let Err(err) = outbox.put(&next).await {
                        tracing::warn!(error = %err, "failed to record retry");
                    }
                }
                {
                    let mut queue = self.queue.lock();
                    if let Some(slot) = queue.iter_mut().find(|q| q.id == next.id) {
                        *slot = next;
                    }
                }
                if let Err(err) = transaction.mark_persisting() {
                    tracing::debug!(error = %err, "transaction no longer executing");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, attempts = entry.retry_count + 1, "transaction failed permanently");
                let error = OfflineError::Execution(e.clone());
                self.finish_failed(&entry, &transaction, e, error).await;
            }
        }
    }

    async fn finish_failed(
        &self,
        entry: &OutboxEntry,
        transaction: &Transaction,
        cause: ExecutionError,
        error: OfflineError,
    ) {
        self.forget(&entry.id).await;
        if let Err(e) = transaction.fail(EngineError::Execution(cause)) {
            tracing::debug!(error = %e, "transaction settled elsewhere");
        }
        self.resolve(&entry.id, Err(error));
    }

    /// Remove a finished entry from storage, the queue and the live set.
    async fn forget(&self, id: &str) {
        if let Some(outbox) = &self.outbox {
            if let Err(e) = outbox.remove(id).await {
                tracing::warn!(transaction_id = %id, error = %e, "failed to remove outbox entry");
            }
        }
        self.queue.lock().retain(|e| e.id != id);
        self.transactions.remove(id);
    }
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn drain_loop(inner: Weak<ExecutorInner>, wake: Arc<Notify>) {
    loop {
        let step = match inner.upgrade() {
            Some(inner) => match inner.next_step() {
                Step::Run(entry) => {
                    inner.execute(entry).await;
                    continue;
                }
                step => step,
            },
            None => return,
        };

        match step {
            Step::Idle => wake.notified().await,
            Step::Wait(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wake.notified() => {}
                }
            }
            Step::Run(_) | Step::Stop => return,
        }
    }
}

async fn watch_leadership(inner: Weak<ExecutorInner>, mut rx: watch::Receiver<bool>) {
    while rx.changed().await.is_ok() {
        let leader = *rx.borrow_and_update();
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.set_leader(leader, false).await;
    }
}

async fn watch_connectivity(inner: Weak<ExecutorInner>, mut rx: watch::Receiver<bool>) {
    while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if online {
            tracing::debug!("back online, retrying queued transactions");
            inner.reset_retry_delays();
        }
        inner.wake.notify_one();
    }
}
