//! Synced state, optimistic overlay and sync reconciliation.
//!
//! The visible value of a key is the synced value with the optimistic overlay
//! applied on top. The overlay is never edited directly: it is recomputed from
//! the active transactions registered with the collection.

use crate::change::{ChangeMessage, ChangeType};
use crate::sync::RowUpdateMode;
use crate::transaction::{Transaction, TransactionState};
use crate::{Key, MutationType};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One write buffered inside a sync transaction.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SyncOperation {
    pub kind: ChangeType,
    pub key: Key,
    pub value: Value,
    pub metadata: Option<Value>,
}

/// Optimistic overlay captured when a truncate starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct OverlaySnapshot {
    pub upserts: BTreeMap<Key, Value>,
    pub deletes: BTreeSet<Key>,
}

/// A sync transaction opened with `begin`.
#[derive(Debug, Default)]
pub(crate) struct PendingSyncedTransaction {
    pub committed: bool,
    pub operations: Vec<SyncOperation>,
    pub deleted_keys: BTreeSet<Key>,
    pub truncate: bool,
    pub overlay_snapshot: Option<OverlaySnapshot>,
}

/// Outcome of applying committed sync transactions.
#[derive(Debug, Default)]
pub(crate) struct SyncCommit {
    pub events: Vec<ChangeMessage>,
    pub truncated: bool,
}

#[derive(Default)]
pub(crate) struct StateManager {
    collection_id: String,
    pub synced: BTreeMap<Key, Value>,
    pub synced_metadata: HashMap<Key, Value>,
    upserts: BTreeMap<Key, Value>,
    deletes: BTreeSet<Key>,
    size: usize,
    transactions: BTreeMap<u64, Transaction>,
    transaction_order: HashMap<String, u64>,
    next_order: u64,
    pub pending_synced: Vec<PendingSyncedTransaction>,
    pre_sync_visible: HashMap<Key, Value>,
    recently_synced: BTreeSet<Key>,
    committing_sync: bool,
    pub has_received_first_commit: bool,
}

impl StateManager {
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            ..Self::default()
        }
    }

    /// Visible value of `key`.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        if self.deletes.contains(key) {
            return None;
        }
        self.upserts.get(key).or_else(|| self.synced.get(key))
    }

    pub fn has(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Visible keys in key order.
    pub fn keys(&self) -> Vec<Key> {
        let mut keys: BTreeSet<&Key> = self
            .synced
            .keys()
            .filter(|k| !self.deletes.contains(*k))
            .collect();
        keys.extend(self.upserts.keys());
        keys.into_iter().cloned().collect()
    }

    /// Visible entries in key order.
    pub fn entries(&self) -> Vec<(Key, Value)> {
        self.keys()
            .into_iter()
            .filter_map(|k| self.get(&k).cloned().map(|v| (k, v)))
            .collect()
    }

    pub fn is_optimistic(&self, key: &Key) -> bool {
        self.upserts.contains_key(key) || self.deletes.contains(key)
    }

    fn calculate_size(&self) -> usize {
        let deleted_synced = self
            .deletes
            .iter()
            .filter(|k| self.synced.contains_key(*k))
            .count();
        let new_upserts = self
            .upserts
            .keys()
            .filter(|k| !self.synced.contains_key(*k))
            .count();
        self.synced.len() - deleted_synced + new_upserts
    }

    // Transaction registry

    /// Register a transaction; registration order decides overlay precedence.
    pub fn register_transaction(&mut self, transaction: &Transaction) {
        if self.transaction_order.contains_key(transaction.id()) {
            return;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.transaction_order
            .insert(transaction.id().to_string(), order);
        self.transactions.insert(order, transaction.clone());
    }

    pub fn remove_transaction(&mut self, id: &str) {
        if let Some(order) = self.transaction_order.remove(id) {
            self.transactions.remove(&order);
        }
    }

    /// Drop settled transactions from the registry.
    pub fn prune_settled_transactions(&mut self) {
        let settled: Vec<String> = self
            .transactions
            .values()
            .filter(|tx| !tx.state().is_active())
            .map(|tx| tx.id().to_string())
            .collect();
        for id in settled {
            self.remove_transaction(&id);
        }
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    pub fn has_executing_transaction(&self) -> bool {
        self.transactions
            .values()
            .any(|tx| tx.state() == TransactionState::Executing)
    }

    /// Pending transactions other than `except` touching any of `keys`.
    pub fn pending_transactions_touching(
        &self,
        keys: &std::collections::HashSet<Key>,
        except: &str,
    ) -> Vec<Transaction> {
        self.transactions
            .values()
            .filter(|tx| tx.id() != except && tx.state() == TransactionState::Pending)
            .filter(|tx| {
                tx.keys_for(&self.collection_id)
                    .iter()
                    .any(|k| keys.contains(k))
            })
            .cloned()
            .collect()
    }

    fn overlay_active_transactions(&mut self) {
        for tx in self.transactions.values() {
            if !tx.state().is_active() {
                continue;
            }
            for mutation in tx.mutations() {
                if mutation.collection_id != self.collection_id || !mutation.optimistic {
                    continue;
                }
                match mutation.mutation_type {
                    MutationType::Insert | MutationType::Update => {
                        if let Some(modified) = mutation.modified {
                            self.deletes.remove(&mutation.key);
                            self.upserts.insert(mutation.key, modified);
                        }
                    }
                    MutationType::Delete => {
                        self.upserts.remove(&mutation.key);
                        self.deletes.insert(mutation.key);
                    }
                }
            }
        }
    }

    /// Rebuild the overlay from active transactions, returning visible changes.
    pub fn recompute_optimistic_state(&mut self, triggered_by_user: bool) -> Vec<ChangeMessage> {
        if self.committing_sync && !triggered_by_user {
            return Vec::new();
        }

        let previous_upserts = std::mem::take(&mut self.upserts);
        let previous_deletes = std::mem::take(&mut self.deletes);
        self.overlay_active_transactions();
        self.size = self.calculate_size();

        let events = self.collect_optimistic_changes(&previous_upserts, &previous_deletes);
        if triggered_by_user {
            return events;
        }

        let events = events
            .into_iter()
            .filter(|e| !self.recently_synced.contains(&e.key));

        if self.pending_synced.is_empty() {
            return events.collect();
        }

        let pending_sync_keys: BTreeSet<&Key> = self
            .pending_synced
            .iter()
            .flat_map(|t| t.operations.iter().map(|op| &op.key))
            .collect();
        let active_keys: BTreeSet<Key> = self
            .transactions
            .values()
            .filter(|tx| tx.state().is_active())
            .flat_map(|tx| tx.keys_for(&self.collection_id))
            .collect();

        events
            .filter(|e| {
                !(e.change_type == ChangeType::Delete
                    && pending_sync_keys.contains(&e.key)
                    && !active_keys.contains(&e.key))
            })
            .collect()
    }

    fn collect_optimistic_changes(
        &self,
        previous_upserts: &BTreeMap<Key, Value>,
        previous_deletes: &BTreeSet<Key>,
    ) -> Vec<ChangeMessage> {
        let touched: BTreeSet<&Key> = previous_upserts
            .keys()
            .chain(previous_deletes.iter())
            .chain(self.upserts.keys())
            .chain(self.deletes.iter())
            .collect();

        let mut events = Vec::new();
        for key in touched {
            let previous = if previous_deletes.contains(key) {
                None
            } else {
                previous_upserts.get(key).or_else(|| self.synced.get(key))
            };
            let current = self.get(key);
            if let Some(event) = diff_event(key, previous, current) {
                events.push(event);
            }
        }
        events
    }

    /// Remember the visible value of keys about to be overwritten by sync.
    ///
    /// Must run before the overlay of a settling transaction is dropped.
    pub fn capture_pre_sync_visible_state(&mut self) {
        let keys: BTreeSet<Key> = self
            .pending_synced
            .iter()
            .flat_map(|t| t.operations.iter().map(|op| op.key.clone()))
            .collect();

        for key in keys {
            if !self.pre_sync_visible.contains_key(&key) {
                if let Some(value) = self.get(&key).cloned() {
                    self.pre_sync_visible.insert(key.clone(), value);
                }
            }
            self.recently_synced.insert(key);
        }
    }

    /// Overlay as it is now, for truncate.
    pub fn overlay_snapshot(&self) -> OverlaySnapshot {
        OverlaySnapshot {
            upserts: self.upserts.clone(),
            deletes: self.deletes.clone(),
        }
    }

    /// Apply committed sync transactions to the synced base.
    ///
    /// Returns `None` while a transaction is executing, unless a truncate is
    /// among the committed sync transactions.
    pub fn commit_pending_transactions(&mut self, mode: RowUpdateMode) -> Option<SyncCommit> {
        let has_truncate = self
            .pending_synced
            .iter()
            .any(|t| t.committed && t.truncate);
        if self.has_executing_transaction() && !has_truncate {
            return None;
        }

        let (committed, uncommitted): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_synced)
            .into_iter()
            .partition(|t| t.committed);
        self.pending_synced = uncommitted;
        self.committing_sync = true;

        let truncate_snapshot = committed
            .iter()
            .find(|t| t.truncate)
            .and_then(|t| t.overlay_snapshot.clone())
            .unwrap_or_default();

        let changed_keys: BTreeSet<Key> = committed
            .iter()
            .flat_map(|t| t.operations.iter().map(|op| op.key.clone()))
            .collect();

        let mut visible_before = if self.pre_sync_visible.is_empty() {
            changed_keys
                .iter()
                .filter_map(|k| self.get(k).cloned().map(|v| (k.clone(), v)))
                .collect()
        } else {
            std::mem::take(&mut self.pre_sync_visible)
        };

        let mut events = Vec::new();
        for transaction in &committed {
            if transaction.truncate {
                let visible: BTreeSet<Key> = self
                    .synced
                    .keys()
                    .chain(truncate_snapshot.upserts.keys())
                    .cloned()
                    .collect();
                for key in visible {
                    if truncate_snapshot.deletes.contains(&key) {
                        continue;
                    }
                    let previous = truncate_snapshot
                        .upserts
                        .get(&key)
                        .or_else(|| self.synced.get(&key));
                    if let Some(previous) = previous {
                        events.push(ChangeMessage::delete(key.clone(), previous.clone()));
                    }
                }
                self.synced.clear();
                self.synced_metadata.clear();
                for key in &changed_keys {
                    visible_before.remove(key);
                }
            }

            for op in &transaction.operations {
                self.apply_sync_operation(op, mode);
            }
        }

        if has_truncate {
            self.reapply_truncated_overlay(&committed, &truncate_snapshot, &mut events);
        }

        self.upserts.clear();
        self.deletes.clear();
        self.committing_sync = false;
        if has_truncate {
            self.upserts = truncate_snapshot.upserts.clone();
            self.deletes = truncate_snapshot.deletes.clone();
        }
        self.overlay_active_transactions();

        let completed = self.completed_optimistic_ops(&changed_keys);
        for key in &changed_keys {
            let previous = visible_before.get(key);
            let current = self.get(key);

            let redundant = completed.get(key).is_some_and(|(kind, value)| match kind {
                MutationType::Delete => {
                    current.is_none() && previous.is_some() && previous == value.as_ref()
                }
                _ => current.is_some() && current == value.as_ref(),
            });
            if redundant {
                continue;
            }
            if let Some(event) = diff_event(key, previous, current) {
                events.push(event);
            }
        }

        self.size = self.calculate_size();
        self.pre_sync_visible.clear();
        self.recently_synced.clear();
        self.has_received_first_commit = true;

        Some(SyncCommit {
            events,
            truncated: has_truncate,
        })
    }

    fn apply_sync_operation(&mut self, op: &SyncOperation, mode: RowUpdateMode) {
        match op.kind {
            ChangeType::Insert => {
                match &op.metadata {
                    Some(m) => self.synced_metadata.insert(op.key.clone(), m.clone()),
                    None => self.synced_metadata.remove(&op.key),
                };
                self.synced.insert(op.key.clone(), op.value.clone());
            }
            ChangeType::Update => {
                if let Some(m) = &op.metadata {
                    let merged = shallow_merge(self.synced_metadata.get(&op.key), m);
                    self.synced_metadata.insert(op.key.clone(), merged);
                }
                let next = match mode {
                    RowUpdateMode::Partial => shallow_merge(self.synced.get(&op.key), &op.value),
                    RowUpdateMode::Full => op.value.clone(),
                };
                self.synced.insert(op.key.clone(), next);
            }
            ChangeType::Delete => {
                self.synced_metadata.remove(&op.key);
                self.synced.remove(&op.key);
            }
        }
    }

    fn reapply_truncated_overlay(
        &self,
        committed: &[PendingSyncedTransaction],
        snapshot: &OverlaySnapshot,
        events: &mut Vec<ChangeMessage>,
    ) {
        let synced_upserted: BTreeSet<&Key> = committed
            .iter()
            .flat_map(|t| t.operations.iter())
            .filter(|op| op.kind != ChangeType::Delete)
            .map(|op| &op.key)
            .collect();

        for (key, value) in &snapshot.upserts {
            if snapshot.deletes.contains(key) {
                continue;
            }
            let existing = if synced_upserted.contains(key) {
                events
                    .iter_mut()
                    .rev()
                    .find(|e| &e.key == key && e.change_type == ChangeType::Insert)
            } else {
                None
            };
            match existing {
                Some(event) => event.value = value.clone(),
                None => events.push(ChangeMessage::insert(key.clone(), value.clone())),
            }
        }

        if !snapshot.deletes.is_empty() {
            events.retain(|e| {
                !(e.change_type == ChangeType::Insert && snapshot.deletes.contains(&e.key))
            });
        }
    }

    fn completed_optimistic_ops(
        &self,
        changed_keys: &BTreeSet<Key>,
    ) -> HashMap<Key, (MutationType, Option<Value>)> {
        let mut ops = HashMap::new();
        for tx in self.transactions.values() {
            if tx.state() != TransactionState::Completed {
                continue;
            }
            for m in tx.mutations() {
                if m.collection_id == self.collection_id
                    && m.optimistic
                    && changed_keys.contains(&m.key)
                {
                    let value = match m.mutation_type {
                        MutationType::Delete => m.original,
                        _ => m.modified,
                    };
                    ops.insert(m.key, (m.mutation_type, value));
                }
            }
        }
        ops
    }

    /// Drop synced data. Active transactions stay registered and visible.
    pub fn clear(&mut self) {
        self.synced.clear();
        self.synced_metadata.clear();
        self.upserts.clear();
        self.deletes.clear();
        self.pending_synced.clear();
        self.pre_sync_visible.clear();
        self.recently_synced.clear();
        self.committing_sync = false;
        self.has_received_first_commit = false;
        self.prune_settled_transactions();
        self.overlay_active_transactions();
        self.size = self.calculate_size();
    }
}

fn shallow_merge(existing: Option<&Value>, patch: &Value) -> Value {
    match (existing, patch) {
        (Some(Value::Object(base)), Value::Object(changes)) => {
            let mut merged = base.clone();
            for (k, v) in changes {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

fn diff_event(key: &Key, previous: Option<&Value>, current: Option<&Value>) -> Option<ChangeMessage> {
    match (previous, current) {
        (None, Some(c)) => Some(ChangeMessage::insert(key.clone(), c.clone())),
        (Some(p), None) => Some(ChangeMessage::delete(key.clone(), p.clone())),
        (Some(p), Some(c)) if p != c => {
            Some(ChangeMessage::update(key.clone(), c.clone(), p.clone()))
        }
        _ => None,
    }
}
