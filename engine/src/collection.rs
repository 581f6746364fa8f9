//! Collections.
//!
//! A [`Collection`] is a cheap handle to shared state. Every operation runs
//! under a per-collection turn lock: the core state is locked, changed, and
//! released, and only then are the resulting change batches, events and
//! callbacks delivered. The turn lock is reentrant, so listeners may call
//! back into the collection while a delivery is in progress.

use crate::changes::ChangeBuffer;
use crate::compare::{compare_values, CompareOptions};
use crate::events::{CollectionEvent, EventBus, EventHandler, EventKind, ListenerId};
use crate::index::{IndexQuery, IndexStats, RangeQuery, ReverseIndex};
use crate::index_manager::{AutoIndex, IndexInfo, IndexManager, IndexOptions, OrderBy};
use crate::lifecycle::{CollectionStatus, Lifecycle, ReadyCallback};
use crate::schema::SchemaValidator;
use crate::snapshot::CollectionSnapshot;
use crate::state::{PendingSyncedTransaction, StateManager, SyncOperation};
use crate::subscription::{ChangeCallback, SubscribeOptions, Subscription, SubscriptionShared};
use crate::sync::{
    LoadSubsetFn, LoadSubsetOptions, LocalOnlySource, RowUpdateMode, SyncMessage, SyncSource,
    SyncTarget, SyncWriter,
};
use crate::transaction::{MutationFn, Transaction, TransactionObserver};
use crate::{
    error::Result, ChangeMessage, ChangeType, CollectionId, Comparison, Error, Expr, Key,
};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default delay before an unobserved collection is cleaned up.
pub const DEFAULT_GC_TIME: Duration = Duration::from_millis(300_000);

/// Longest accepted GC delay.
pub const MAX_GC_TIME: Duration = Duration::from_millis(i32::MAX as u64);

/// Extracts the key of an item. `None` means the item has no usable key.
pub type KeyFn = Arc<dyn Fn(&Value) -> Option<Key> + Send + Sync>;

/// Key extractor reading a top-level field.
pub fn key_field(name: &str) -> KeyFn {
    let name = name.to_string();
    Arc::new(move |item: &Value| item.get(&name).and_then(Key::from_value))
}

/// Configuration of a [`Collection`].
#[derive(Clone)]
pub struct CollectionConfig {
    pub id: Option<CollectionId>,
    pub key_fn: Option<KeyFn>,
    pub schema: Option<Arc<dyn SchemaValidator>>,
    /// Backend feeding the collection. Defaults to an empty [`LocalOnlySource`].
    pub sync: Option<Arc<dyn SyncSource>>,
    /// Zero disables garbage collection.
    pub gc_time: Duration,
    pub auto_index: AutoIndex,
    /// Start sync at construction instead of on first use.
    pub start_sync: bool,
    /// Ordering used by full-scan snapshots without an explicit order.
    pub compare: CompareOptions,
    pub row_update_mode: RowUpdateMode,
    pub on_insert: Option<MutationFn>,
    pub on_update: Option<MutationFn>,
    pub on_delete: Option<MutationFn>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            id: None,
            key_fn: None,
            schema: None,
            sync: None,
            gc_time: DEFAULT_GC_TIME,
            auto_index: AutoIndex::default(),
            start_sync: false,
            compare: CompareOptions::default(),
            row_update_mode: RowUpdateMode::default(),
            on_insert: None,
            on_update: None,
            on_delete: None,
        }
    }
}

impl CollectionConfig {
    pub fn new(key_fn: KeyFn) -> Self {
        Self {
            key_fn: Some(key_fn),
            ..Self::default()
        }
    }

    /// A collection without a backend: ready immediately, seeded with
    /// `initial`, confirming its own transactions. Confirmed rows replace
    /// the synced row whole.
    pub fn local_only(key_fn: KeyFn, initial: Vec<Value>) -> Self {
        let source = LocalOnlySource::new().with_initial_data(initial);
        let confirm = source.mutation_fn();
        Self::new(key_fn)
            .start_sync()
            .with_row_update_mode(RowUpdateMode::Full)
            .with_sync(Arc::new(source))
            .on_insert(confirm.clone())
            .on_update(confirm.clone())
            .on_delete(confirm)
    }

    pub fn with_id(mut self, id: impl Into<CollectionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_schema(mut self, schema: Arc<dyn SchemaValidator>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_sync(mut self, sync: Arc<dyn SyncSource>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn with_auto_index(mut self, auto_index: AutoIndex) -> Self {
        self.auto_index = auto_index;
        self
    }

    pub fn start_sync(mut self) -> Self {
        self.start_sync = true;
        self
    }

    pub fn with_compare(mut self, compare: CompareOptions) -> Self {
        self.compare = compare;
        self
    }

    pub fn with_row_update_mode(mut self, mode: RowUpdateMode) -> Self {
        self.row_update_mode = mode;
        self
    }

    pub fn on_insert(mut self, f: MutationFn) -> Self {
        self.on_insert = Some(f);
        self
    }

    pub fn on_update(mut self, f: MutationFn) -> Self {
        self.on_update = Some(f);
        self
    }

    pub fn on_delete(mut self, f: MutationFn) -> Self {
        self.on_delete = Some(f);
        self
    }
}

/// Options for [`Collection::current_state_as_changes`].
#[derive(Debug, Clone, Default)]
pub struct CurrentStateOptions {
    pub where_expr: Option<Expr>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    /// Return `None` instead of scanning when no index can answer.
    pub optimized_only: bool,
}

/// Work produced under the core lock, delivered after it is released.
pub(crate) enum Outbound {
    Changes(Vec<ChangeMessage>),
    Event(CollectionEvent),
    Ready(ReadyCallback),
    EmptyReady,
}

pub(crate) struct Core {
    pub id: CollectionId,
    pub state: StateManager,
    pub indexes: IndexManager,
    pub changes: ChangeBuffer,
    pub lifecycle: Lifecycle,
    pub active_subscribers: usize,
    row_update_mode: RowUpdateMode,
    out: Vec<Outbound>,
}

impl Core {
    fn new(id: CollectionId, row_update_mode: RowUpdateMode) -> Self {
        Self {
            state: StateManager::new(id.clone()),
            indexes: IndexManager::default(),
            changes: ChangeBuffer::default(),
            lifecycle: Lifecycle::default(),
            active_subscribers: 0,
            row_update_mode,
            out: Vec::new(),
            id,
        }
    }

    pub fn push_event(&mut self, event: CollectionEvent) {
        self.out.push(Outbound::Event(event));
    }

    /// Keep indexes current and queue `changes` for subscribers.
    pub fn emit(&mut self, changes: Vec<ChangeMessage>, force: bool) {
        self.indexes.update(&changes);
        if let Some(batch) = self.changes.emit(changes, force) {
            self.out.push(Outbound::Changes(batch));
        }
    }

    pub fn recompute(&mut self, triggered_by_user: bool) {
        let changes = self.state.recompute_optimistic_state(triggered_by_user);
        self.emit(changes, triggered_by_user);
    }

    pub fn set_status(&mut self, next: CollectionStatus) -> Result<()> {
        let previous = self.lifecycle.set_status(next)?;
        if previous == next {
            return Ok(());
        }
        if next == CollectionStatus::Ready {
            self.indexes.resolve_all(&self.state);
        }
        tracing::debug!(collection = %self.id, from = %previous, to = %next, "status changed");
        self.push_event(CollectionEvent::StatusChange {
            collection_id: self.id.clone(),
            previous,
            status: next,
        });
        Ok(())
    }

    pub fn mark_ready(&mut self) -> Result<()> {
        let status = self.lifecycle.status();
        if !status.can_transition_to(CollectionStatus::Ready) {
            return Err(Error::InvalidStatusTransition {
                from: status.to_string(),
                to: CollectionStatus::Ready.to_string(),
            });
        }
        if status != CollectionStatus::Loading {
            return Ok(());
        }

        self.set_status(CollectionStatus::Ready)?;
        self.state.has_received_first_commit = true;
        tracing::info!(collection = %self.id, "collection ready");
        for callback in self.lifecycle.take_first_ready() {
            self.out.push(Outbound::Ready(callback));
        }
        if self.active_subscribers > 0 {
            self.out.push(Outbound::EmptyReady);
        }
        Ok(())
    }

    fn on_transaction_state_change(&mut self) {
        self.changes.should_batch = !self.state.pending_synced.is_empty();
        self.state.capture_pre_sync_visible_state();
        self.recompute(false);
        if !self.state.pending_synced.is_empty() {
            self.commit_pending_sync();
        }
        self.state.prune_settled_transactions();
    }

    fn commit_pending_sync(&mut self) {
        let Some(commit) = self.state.commit_pending_transactions(self.row_update_mode) else {
            return;
        };
        if commit.truncated {
            self.push_event(CollectionEvent::Truncate {
                collection_id: self.id.clone(),
            });
            if self.lifecycle.status() != CollectionStatus::Ready {
                if let Err(e) = self.mark_ready() {
                    tracing::warn!(collection = %self.id, error = %e, "could not mark ready after truncate");
                }
            }
        }
        self.emit(commit.events, true);
    }

    fn pending_sync_mut(&mut self) -> Result<&mut PendingSyncedTransaction> {
        let pending = self
            .state
            .pending_synced
            .last_mut()
            .ok_or(Error::NoPendingSyncTransactionWrite)?;
        if pending.committed {
            return Err(Error::SyncTransactionAlreadyCommitted);
        }
        Ok(pending)
    }

    fn write_sync(&mut self, key: Key, message: SyncMessage) -> Result<()> {
        let synced_value = self.state.synced.get(&key).cloned();
        let pending = self.pending_sync_mut()?;

        let mut kind = message.kind;
        if kind == ChangeType::Insert && !pending.deleted_keys.contains(&key) && !pending.truncate {
            if let Some(existing) = synced_value {
                if existing != message.value {
                    return Err(Error::DuplicateKeySync(key));
                }
                kind = ChangeType::Update;
            }
        }
        if kind == ChangeType::Delete {
            pending.deleted_keys.insert(key.clone());
        }
        pending.operations.push(SyncOperation {
            kind,
            key,
            value: message.value,
            metadata: message.metadata,
        });
        Ok(())
    }

    fn truncate_sync(&mut self) -> Result<()> {
        let snapshot = self.state.overlay_snapshot();
        let pending = self.pending_sync_mut()?;
        pending.operations.clear();
        pending.deleted_keys.clear();
        pending.truncate = true;
        pending.overlay_snapshot = Some(snapshot);
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.state.clear();
        self.changes.clear();
        self.indexes.rebuild(&self.state);
        self.lifecycle.reset();
        self.set_status(CollectionStatus::CleanedUp)
    }
}

#[derive(Default)]
struct SyncRuntime {
    generation: u64,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
    load_subset: Option<LoadSubsetFn>,
}

pub(crate) struct CollectionInner {
    id: CollectionId,
    pub(crate) config: CollectionConfig,
    pub(crate) key_fn: KeyFn,
    source: Arc<dyn SyncSource>,
    turn: ReentrantMutex<()>,
    pub(crate) core: Mutex<Core>,
    subscribers: Mutex<Vec<Arc<SubscriptionShared>>>,
    events: EventBus,
    sync: Mutex<SyncRuntime>,
    gc: Mutex<Option<JoinHandle<()>>>,
    status_tx: watch::Sender<CollectionStatus>,
    this: Weak<CollectionInner>,
}

impl CollectionInner {
    /// Run `f` against the core, then deliver what it produced.
    pub(crate) fn run<R>(&self, f: impl FnOnce(&mut Core) -> Result<R>) -> Result<R> {
        let _turn = self.turn.lock();
        let (result, outbound) = {
            let mut core = self.core.lock();
            let result = f(&mut *core);
            (result, std::mem::take(&mut core.out))
        };
        self.deliver(outbound);
        result
    }

    fn deliver(&self, outbound: Vec<Outbound>) {
        for item in outbound {
            match item {
                Outbound::Changes(batch) => {
                    for subscriber in self.subscribers.lock().clone() {
                        subscriber.emit_events(&batch);
                    }
                }
                Outbound::Event(event) => {
                    if let CollectionEvent::StatusChange { status, .. } = &event {
                        self.status_tx.send_replace(*status);
                    }
                    self.events.emit(&event);
                }
                Outbound::Ready(callback) => callback(),
                Outbound::EmptyReady => {
                    for subscriber in self.subscribers.lock().clone() {
                        subscriber.emit_events(&[]);
                    }
                }
            }
        }
    }

    fn status(&self) -> CollectionStatus {
        self.core.lock().lifecycle.status()
    }

    fn is_stale(&self, generation: u64) -> bool {
        let stale = self.sync.lock().generation != generation;
        if stale {
            tracing::debug!(collection = %self.id, generation, "ignoring write from a previous sync session");
        }
        stale
    }

    fn start_sync(&self) -> Result<()> {
        let _turn = self.turn.lock();
        if !matches!(
            self.status(),
            CollectionStatus::Idle | CollectionStatus::CleanedUp
        ) {
            return Ok(());
        }
        self.run(|core| core.set_status(CollectionStatus::Loading))?;

        let generation = {
            let mut sync = self.sync.lock();
            sync.generation += 1;
            sync.generation
        };
        let target: Weak<dyn SyncTarget> = self.this.clone();
        let writer = SyncWriter::new(target, generation, self.id.clone());

        match self.source.start(writer) {
            Ok(session) => {
                let (cleanup, load_subset) = session.into_parts();
                let mut sync = self.sync.lock();
                sync.cleanup = cleanup;
                sync.load_subset = load_subset;
                tracing::debug!(collection = %self.id, generation, "sync started");
                Ok(())
            }
            Err(e) => {
                tracing::error!(collection = %self.id, error = %e, "sync failed to start");
                if let Err(status_err) = self.run(|core| core.set_status(CollectionStatus::Error)) {
                    tracing::warn!(collection = %self.id, error = %status_err, "could not enter error state");
                }
                Err(e)
            }
        }
    }

    /// Reject use of a failed collection and restart a cleaned-up one.
    pub(crate) fn validate_usable(&self) -> Result<()> {
        match self.status() {
            CollectionStatus::Error => Err(Error::CollectionInErrorState(self.id.clone())),
            CollectionStatus::CleanedUp => self.start_sync(),
            _ => Ok(()),
        }
    }

    /// Register `transaction` and show its mutations in the overlay.
    pub(crate) fn track_transaction(&self, transaction: &Transaction) -> Result<()> {
        let observer: Weak<dyn TransactionObserver> = self.this.clone();
        transaction.attach_observer(observer);
        self.run(|core| {
            core.state.register_transaction(transaction);
            core.recompute(true);
            Ok(())
        })
    }

    fn add_subscriber(&self) -> Result<()> {
        if let Some(timer) = self.gc.lock().take() {
            timer.abort();
        }
        self.run(|core| {
            let previous = core.active_subscribers;
            core.active_subscribers += 1;
            core.push_event(CollectionEvent::SubscribersChange {
                collection_id: core.id.clone(),
                previous,
                active: core.active_subscribers,
            });
            Ok(())
        })?;
        if matches!(
            self.status(),
            CollectionStatus::Idle | CollectionStatus::CleanedUp
        ) {
            self.start_sync()?;
        }
        Ok(())
    }

    fn remove_subscriber(&self, subscription_id: &str) -> Result<()> {
        let _turn = self.turn.lock();
        self.subscribers
            .lock()
            .retain(|s| s.id() != subscription_id);
        let remaining = self.run(|core| {
            if core.active_subscribers == 0 {
                return Err(Error::NegativeSubscriberCount(core.id.clone()));
            }
            let previous = core.active_subscribers;
            core.active_subscribers -= 1;
            core.push_event(CollectionEvent::SubscribersChange {
                collection_id: core.id.clone(),
                previous,
                active: core.active_subscribers,
            });
            Ok(core.active_subscribers)
        })?;
        if remaining == 0 {
            self.start_gc_timer();
        }
        Ok(())
    }

    fn start_gc_timer(&self) {
        let gc_time = self.config.gc_time;
        if gc_time.is_zero() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(collection = %self.id, "no runtime, garbage collection disabled");
            return;
        };
        let weak = self.this.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(gc_time).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.core.lock().active_subscribers > 0 {
                return;
            }
            inner.gc.lock().take();
            tracing::debug!(collection = %inner.id, "garbage collecting idle collection");
            if let Err(e) = inner.cleanup() {
                tracing::warn!(collection = %inner.id, error = %e, "garbage collection failed");
            }
        });
        if let Some(previous) = self.gc.lock().replace(task) {
            previous.abort();
        }
    }

    fn cleanup(&self) -> Result<()> {
        let _turn = self.turn.lock();
        if let Some(timer) = self.gc.lock().take() {
            timer.abort();
        }
        let cleanup = {
            let mut sync = self.sync.lock();
            sync.generation += 1;
            sync.load_subset = None;
            sync.cleanup.take()
        };
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        self.run(Core::cleanup)
    }
}

impl TransactionObserver for CollectionInner {
    fn observer_id(&self) -> &str {
        &self.id
    }

    fn transaction_state_changed(&self, _transaction: &Transaction) {
        let result = self.run(|core| {
            core.on_transaction_state_change();
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(collection = %self.id, error = %e, "failed to apply transaction state change");
        }
    }

    fn pending_transactions_touching(&self, keys: &HashSet<Key>, except: &str) -> Vec<Transaction> {
        self.core
            .lock()
            .state
            .pending_transactions_touching(keys, except)
    }
}

impl SyncTarget for CollectionInner {
    fn sync_begin(&self, generation: u64) -> Result<()> {
        if self.is_stale(generation) {
            return Ok(());
        }
        self.run(|core| {
            core.state
                .pending_synced
                .push(PendingSyncedTransaction::default());
            Ok(())
        })
    }

    fn sync_write(&self, generation: u64, message: SyncMessage) -> Result<()> {
        if self.is_stale(generation) {
            return Ok(());
        }
        let key = match &message.key {
            Some(key) => key.clone(),
            None => (self.key_fn)(&message.value)
                .ok_or_else(|| Error::UndefinedKey(message.value.to_string()))?,
        };
        self.run(|core| core.write_sync(key, message))
    }

    fn sync_commit(&self, generation: u64) -> Result<()> {
        if self.is_stale(generation) {
            return Ok(());
        }
        self.run(|core| {
            let pending = core
                .state
                .pending_synced
                .last_mut()
                .ok_or(Error::NoPendingSyncTransactionCommit)?;
            if pending.committed {
                return Err(Error::SyncTransactionAlreadyCommitted);
            }
            pending.committed = true;
            core.commit_pending_sync();
            Ok(())
        })
    }

    fn sync_truncate(&self, generation: u64) -> Result<()> {
        if self.is_stale(generation) {
            return Ok(());
        }
        self.run(Core::truncate_sync)
    }

    fn sync_mark_ready(&self, generation: u64) -> Result<()> {
        if self.is_stale(generation) {
            return Ok(());
        }
        self.run(Core::mark_ready)
    }
}

/// Handle to a collection. Clones share the same collection.
#[derive(Clone)]
pub struct Collection {
    pub(crate) inner: Arc<CollectionInner>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Collection {
    /// Create a collection. Fails without a key extractor or with an
    /// out-of-range GC time, and when `start_sync` is set and sync fails.
    pub fn new(config: CollectionConfig) -> Result<Self> {
        let key_fn = config.key_fn.clone().ok_or(Error::MissingKeyExtractor)?;
        if config.gc_time > MAX_GC_TIME {
            return Err(Error::InvalidGcTime);
        }
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let source: Arc<dyn SyncSource> = config
            .sync
            .clone()
            .unwrap_or_else(|| Arc::new(LocalOnlySource::new()));
        let (status_tx, _) = watch::channel(CollectionStatus::Idle);

        let inner = Arc::new_cyclic(|this| CollectionInner {
            core: Mutex::new(Core::new(id.clone(), config.row_update_mode)),
            id,
            key_fn,
            source,
            turn: ReentrantMutex::new(()),
            subscribers: Mutex::new(Vec::new()),
            events: EventBus::default(),
            sync: Mutex::new(SyncRuntime::default()),
            gc: Mutex::new(None),
            status_tx,
            this: this.clone(),
            config,
        });

        let collection = Self { inner };
        if collection.inner.config.start_sync {
            collection.start_sync()?;
        }
        Ok(collection)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> CollectionStatus {
        self.inner.status()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == CollectionStatus::Ready
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.core.lock().active_subscribers
    }

    pub(crate) fn turn(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.turn.lock()
    }

    // Reads

    /// Visible value of `key`.
    pub fn get(&self, key: &Key) -> Option<Value> {
        self.inner.core.lock().state.get(key).cloned()
    }

    pub fn has(&self, key: &Key) -> bool {
        self.inner.core.lock().state.has(key)
    }

    pub fn size(&self) -> usize {
        self.inner.core.lock().state.size()
    }

    /// Visible keys in key order.
    pub fn keys(&self) -> Vec<Key> {
        self.inner.core.lock().state.keys()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    pub fn entries(&self) -> Vec<(Key, Value)> {
        self.inner.core.lock().state.entries()
    }

    /// Visible values sorted by the collection's compare options, then by key.
    pub fn to_vec(&self) -> Vec<Value> {
        let options = self.inner.config.compare;
        let mut values = self.values();
        values.sort_by(|a, b| compare_values(a, b, &options));
        values
    }

    /// Whether `key` currently shows an optimistic value.
    pub fn is_optimistic(&self, key: &Key) -> bool {
        self.inner.core.lock().state.is_optimistic(key)
    }

    /// Transactions still contributing to the overlay.
    pub fn active_transactions(&self) -> Vec<Transaction> {
        self.inner
            .core
            .lock()
            .state
            .transactions()
            .filter(|tx| tx.state().is_active())
            .cloned()
            .collect()
    }

    // Lifecycle

    /// Start sync if it is not running.
    pub fn start_sync(&self) -> Result<()> {
        self.inner.start_sync()
    }

    /// Start sync and wait until the collection is ready.
    pub async fn preload(&self) -> Result<()> {
        self.start_sync()?;
        let mut rx = self.inner.status_tx.subscribe();
        let status = *rx
            .wait_for(|s| matches!(s, CollectionStatus::Ready | CollectionStatus::Error))
            .await
            .map_err(|_| Error::CollectionInErrorState(self.inner.id.clone()))?;
        match status {
            CollectionStatus::Error => Err(Error::CollectionInErrorState(self.inner.id.clone())),
            _ => Ok(()),
        }
    }

    /// Wait until the collection reaches `status`.
    pub async fn wait_for_status(&self, status: CollectionStatus) -> Result<()> {
        let mut rx = self.inner.status_tx.subscribe();
        rx.wait_for(|s| *s == status)
            .await
            .map(|_| ())
            .map_err(|_| Error::CollectionInErrorState(self.inner.id.clone()))
    }

    /// Run `callback` the first time the collection becomes ready, or now
    /// if it already has been.
    pub fn on_first_ready(&self, callback: impl FnOnce() + Send + 'static) {
        let result = self.inner.run(|core| {
            if let Some(callback) = core.lifecycle.on_first_ready(Box::new(callback)) {
                core.out.push(Outbound::Ready(callback));
            }
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(collection = %self.inner.id, error = %e, "failed to register ready callback");
        }
    }

    /// Stop sync and drop all cached state. The next use restarts sync.
    pub fn cleanup(&self) -> Result<()> {
        self.inner.cleanup()
    }

    /// Register an event listener.
    pub fn on(&self, kind: EventKind, handler: EventHandler) -> ListenerId {
        self.inner.events.on(kind, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Register a transaction created elsewhere so its mutations for this
    /// collection join the overlay.
    pub fn attach_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.inner.track_transaction(transaction)
    }

    /// Ask the backend to load rows. A no-op without a loader.
    pub fn load_subset(&self, options: LoadSubsetOptions) -> Result<()> {
        let loader = self.inner.sync.lock().load_subset.clone();
        match loader {
            Some(load) => load(options),
            None => Ok(()),
        }
    }

    // Subscriptions

    /// Subscribe to change batches.
    pub fn subscribe_changes(
        &self,
        callback: impl Fn(&[ChangeMessage]) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let _turn = self.turn();
        self.inner.add_subscriber()?;

        let callback: ChangeCallback = Arc::new(callback);
        let shared = Arc::new(SubscriptionShared::new(callback, options.where_expr.clone()));
        let subscription = Subscription::new(shared.clone(), self.clone());

        if let (Some(expr), AutoIndex::Eager) = (&options.where_expr, self.inner.config.auto_index) {
            self.inner.run(|core| {
                let created = core.indexes.ensure_auto_indexes(expr, &core.state);
                for (index_id, name) in created {
                    core.push_event(CollectionEvent::IndexAdded {
                        collection_id: core.id.clone(),
                        index_id,
                        name,
                    });
                }
                Ok(())
            })?;
        }

        if options.include_initial_state {
            subscription.request_snapshot(None)?;
        }
        self.inner.subscribers.lock().push(shared);
        Ok(subscription)
    }

    pub(crate) fn remove_subscriber(&self, subscription_id: &str) -> Result<()> {
        self.inner.remove_subscriber(subscription_id)
    }

    /// Current matching state as insert messages.
    ///
    /// Indexes answer the query when they can. Returns `Ok(None)` when
    /// `optimized_only` is set and no index applies.
    pub fn current_state_as_changes(
        &self,
        options: CurrentStateOptions,
    ) -> Result<Option<Vec<ChangeMessage>>> {
        if options.limit.is_some() && options.order_by.is_none() {
            return Err(Error::LimitWithoutOrderBy);
        }

        let mut guard = self.inner.core.lock();
        let core = &mut *guard;
        let where_expr = options.where_expr.as_ref();
        let matches = |value: &Value| where_expr.map_or(true, |w| w.matches(value));

        if let Some(order_by) = &options.order_by {
            let limit = options.limit.unwrap_or(usize::MAX);
            let keys = match core.indexes.order_index(order_by, &core.state) {
                Some((id, reversed)) => {
                    let Some(base) = core.indexes.get(id) else {
                        return Ok(None);
                    };
                    let state = &core.state;
                    let filter = |key: &Key| state.get(key).is_some_and(|v| matches(v));
                    let reverse;
                    let index: &dyn IndexQuery = if reversed {
                        reverse = ReverseIndex::new(base);
                        &reverse
                    } else {
                        base
                    };
                    index.take(limit, None, Some(&filter))
                }
                None if options.optimized_only => return Ok(None),
                None => {
                    let mut rows: Vec<(Key, Value)> = core
                        .state
                        .entries()
                        .into_iter()
                        .filter(|(_, v)| matches(v))
                        .collect();
                    rows.sort_by(|(_, a), (_, b)| {
                        compare_values(
                            &order_by.expression.evaluate(a),
                            &order_by.expression.evaluate(b),
                            &order_by.options,
                        )
                    });
                    rows.into_iter().take(limit).map(|(k, _)| k).collect()
                }
            };
            return Ok(Some(as_inserts(&core.state, keys)));
        }

        let Some(expr) = where_expr else {
            let all = core
                .state
                .entries()
                .into_iter()
                .map(|(k, v)| ChangeMessage::insert(k, v))
                .collect();
            return Ok(Some(all));
        };

        core.indexes.prepare_for(expr, &core.state);
        let keys: Vec<Key> = match core.indexes.optimize(expr) {
            Some(keys) => keys.into_iter().collect(),
            None if options.optimized_only => return Ok(None),
            None => core.state.keys(),
        };
        let changes = as_inserts(&core.state, keys)
            .into_iter()
            .filter(|c| expr.matches(&c.value))
            .collect();
        Ok(Some(changes))
    }

    pub(crate) fn limited_snapshot(
        &self,
        handle: &IndexHandle,
        limit: usize,
        min_value: Option<&Value>,
        where_expr: Option<&Expr>,
        sent: &HashSet<Key>,
    ) -> Result<Vec<ChangeMessage>> {
        let mut guard = self.inner.core.lock();
        let core = &mut *guard;
        if !core.indexes.ensure_built(handle.id, &core.state) {
            return Err(Error::IndexNotFound(handle.id.to_string()));
        }
        let base = core
            .indexes
            .get(handle.id)
            .ok_or_else(|| Error::IndexNotFound(handle.id.to_string()))?;
        let reverse;
        let index: &dyn IndexQuery = if handle.reversed {
            reverse = ReverseIndex::new(base);
            &reverse
        } else {
            base
        };
        let state = &core.state;

        let mut changes: Vec<ChangeMessage> = Vec::new();
        let mut taken: HashSet<Key> = HashSet::new();
        let mut cursor = min_value.cloned();
        // Every round but the last adds at least one key, so this bound is
        // never reached by a terminating walk.
        let max_rounds = index.key_count() + 1;

        for _ in 0..max_rounds {
            let needed = limit.saturating_sub(changes.len());
            if needed == 0 {
                break;
            }
            let keys = {
                let filter = |key: &Key| {
                    !sent.contains(key)
                        && !taken.contains(key)
                        && state
                            .get(key)
                            .is_some_and(|v| where_expr.map_or(true, |w| w.matches(v)))
                };
                index.take(needed, cursor.as_ref(), Some(&filter))
            };
            if keys.is_empty() {
                break;
            }
            for key in keys {
                if let Some(value) = state.get(&key) {
                    changes.push(ChangeMessage::insert(key.clone(), value.clone()));
                }
                if let Some(indexed) = index.indexed_value(&key) {
                    cursor = Some(indexed);
                }
                taken.insert(key);
            }
        }
        Ok(changes)
    }

    // Indexes

    /// Create an index over `expression`.
    pub fn create_index(&self, expression: Expr, options: IndexOptions) -> Result<IndexHandle> {
        let name = options.name.clone().unwrap_or_default();
        let id = self.inner.run(|core| {
            let id = core.indexes.create(expression, options, &core.state);
            core.push_event(CollectionEvent::IndexAdded {
                collection_id: core.id.clone(),
                index_id: id,
                name,
            });
            Ok(id)
        })?;
        Ok(IndexHandle {
            id,
            reversed: false,
            collection: Arc::downgrade(&self.inner),
        })
    }

    pub fn remove_index(&self, id: u64) -> Result<()> {
        self.inner.run(|core| {
            if !core.indexes.remove(id) {
                return Err(Error::IndexNotFound(id.to_string()));
            }
            core.push_event(CollectionEvent::IndexRemoved {
                collection_id: core.id.clone(),
                index_id: id,
            });
            Ok(())
        })
    }

    pub fn indexes(&self) -> Vec<IndexInfo> {
        self.inner.core.lock().indexes.info()
    }

    /// Handle to an existing index.
    pub fn index(&self, id: u64) -> Option<IndexHandle> {
        self.inner.core.lock().indexes.get(id)?;
        Some(IndexHandle {
            id,
            reversed: false,
            collection: Arc::downgrade(&self.inner),
        })
    }

    // Snapshots

    /// Export the synced state.
    pub fn export_snapshot(&self) -> CollectionSnapshot {
        let core = self.inner.core.lock();
        CollectionSnapshot::new(
            self.inner.id.clone(),
            core.state
                .synced
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Replace the synced state with `snapshot` in one sync transaction.
    pub fn import_snapshot(&self, snapshot: CollectionSnapshot) -> Result<()> {
        snapshot.validate_for(&self.inner.id)?;
        let _turn = self.turn();
        self.validate_usable_for_import()?;
        let generation = self.inner.sync.lock().generation;
        let inner = &self.inner;
        inner.sync_begin(generation)?;
        inner.sync_truncate(generation)?;
        for entry in snapshot.items {
            inner.sync_write(generation, SyncMessage::insert(entry.value).with_key(entry.key))?;
        }
        inner.sync_commit(generation)?;
        tracing::info!(collection = %self.inner.id, "snapshot imported");
        Ok(())
    }

    fn validate_usable_for_import(&self) -> Result<()> {
        self.inner.validate_usable()?;
        if self.status() == CollectionStatus::Idle {
            self.start_sync()?;
        }
        Ok(())
    }
}

fn as_inserts(state: &StateManager, keys: impl IntoIterator<Item = Key>) -> Vec<ChangeMessage> {
    keys.into_iter()
        .filter_map(|key| {
            let value = state.get(&key)?.clone();
            Some(ChangeMessage::insert(key, value))
        })
        .collect()
}

/// Handle to an index of a collection.
///
/// Queries lock the collection for their duration. The handle does not keep
/// the collection alive.
#[derive(Clone)]
pub struct IndexHandle {
    id: u64,
    reversed: bool,
    collection: Weak<CollectionInner>,
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle")
            .field("id", &self.id)
            .field("reversed", &self.reversed)
            .finish()
    }
}

impl IndexHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    /// The same index read in the opposite order.
    pub fn reversed(&self) -> IndexHandle {
        IndexHandle {
            reversed: !self.reversed,
            ..self.clone()
        }
    }

    /// Run `f` against the index. `f` must not call back into the collection.
    pub fn query<R>(&self, f: impl FnOnce(&dyn IndexQuery) -> R) -> Result<R> {
        let missing = || Error::IndexNotFound(self.id.to_string());
        let inner = self.collection.upgrade().ok_or_else(missing)?;
        let mut guard = inner.core.lock();
        let core = &mut *guard;
        if !core.indexes.ensure_built(self.id, &core.state) {
            return Err(missing());
        }
        let base = core.indexes.get(self.id).ok_or_else(missing)?;
        if self.reversed {
            Ok(f(&ReverseIndex::new(base)))
        } else {
            Ok(f(base))
        }
    }

    pub fn lookup(&self, op: Comparison, value: &Value) -> Result<BTreeSet<Key>> {
        self.query(|index| index.lookup(op, value))
    }

    pub fn range_query(&self, query: &RangeQuery) -> Result<Vec<Key>> {
        self.query(|index| index.range_query(query))
    }

    pub fn range_query_reversed(&self, query: &RangeQuery) -> Result<Vec<Key>> {
        self.query(|index| index.range_query_reversed(query))
    }

    pub fn take(&self, n: usize, from: Option<&Value>) -> Result<Vec<Key>> {
        self.query(|index| index.take(n, from, None))
    }

    pub fn take_reversed(&self, n: usize, from: Option<&Value>) -> Result<Vec<Key>> {
        self.query(|index| index.take_reversed(n, from, None))
    }

    pub fn supports(&self, op: Comparison) -> Result<bool> {
        self.query(|index| index.supports(op))
    }

    pub fn key_count(&self) -> Result<usize> {
        self.query(|index| index.key_count())
    }

    pub fn ordered_entries_count(&self) -> Result<usize> {
        self.query(|index| index.ordered_entries_count())
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.query(|index| index.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_count_never_goes_negative() {
        let todos =
            Collection::new(CollectionConfig::local_only(key_field("id"), Vec::new())).unwrap();
        assert!(matches!(
            todos.remove_subscriber("nobody"),
            Err(Error::NegativeSubscriberCount(_))
        ));

        let subscription = todos
            .subscribe_changes(|_| {}, SubscribeOptions::default())
            .unwrap();
        let id = subscription.id().to_string();
        subscription.unsubscribe().unwrap();
        assert_eq!(todos.subscriber_count(), 0);

        assert!(matches!(
            todos.remove_subscriber(&id),
            Err(Error::NegativeSubscriberCount(_))
        ));
        assert_eq!(todos.subscriber_count(), 0);
    }
}
