//! Change subscriptions.
//!
//! Each subscription remembers which keys it has delivered. Until the full
//! state has been sent, an update for an unseen key reaches the listener as
//! an insert and a delete for an unseen key is dropped.

use crate::collection::{Collection, CurrentStateOptions, IndexHandle};
use crate::expression::{and, gt, lt, val, Expr};
use crate::index_manager::OrderBy;
use crate::sync::LoadSubsetOptions;
use crate::{compare::Direction, error::Result, ChangeMessage, ChangeType, Error, Key};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Listener for change batches.
pub type ChangeCallback = Arc<dyn Fn(&[ChangeMessage]) + Send + Sync>;

/// Options for [`Collection::subscribe_changes`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Deliver the current state immediately.
    pub include_initial_state: bool,
    pub where_expr: Option<Expr>,
}

impl SubscribeOptions {
    pub fn with_initial_state(mut self) -> Self {
        self.include_initial_state = true;
        self
    }

    pub fn with_where(mut self, expr: Expr) -> Self {
        self.where_expr = Some(expr);
        self
    }
}

/// A filtered snapshot request.
#[derive(Debug, Clone, Default)]
pub struct SnapshotRequest {
    /// Combined with the subscription's own filter.
    pub where_expr: Option<Expr>,
    /// Fail instead of scanning when no index covers the filter.
    pub optimized_only: bool,
}

/// A snapshot of the first `limit` rows in order-by index order.
#[derive(Debug, Clone)]
pub struct LimitedSnapshotRequest {
    pub order_by: OrderBy,
    pub limit: usize,
    /// Only rows strictly after this indexed value.
    pub min_value: Option<Value>,
}

#[derive(Default)]
struct Tracking {
    sent_keys: HashSet<Key>,
    loaded_initial_state: bool,
    snapshot_sent: bool,
    order_by_index: Option<IndexHandle>,
}

pub(crate) struct SubscriptionShared {
    id: String,
    callback: ChangeCallback,
    where_expr: Option<Expr>,
    tracking: Mutex<Tracking>,
}

impl SubscriptionShared {
    pub fn new(callback: ChangeCallback, where_expr: Option<Expr>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            callback,
            where_expr,
            tracking: Mutex::new(Tracking::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deliver a change batch from the collection.
    ///
    /// An empty batch is the ready signal and is always delivered.
    pub fn emit_events(&self, changes: &[ChangeMessage]) {
        let flipped = self.filter_and_flip(changes);
        let filtered = match &self.where_expr {
            Some(expr) => filter_by_where(expr, flipped),
            None => flipped,
        };
        if filtered.is_empty() && !changes.is_empty() {
            return;
        }
        self.send(&filtered);
    }

    fn send(&self, changes: &[ChangeMessage]) {
        (self.callback)(changes);
        let mut tracking = self.tracking.lock();
        if !tracking.loaded_initial_state {
            tracking
                .sent_keys
                .extend(changes.iter().map(|c| c.key.clone()));
        }
    }

    fn filter_and_flip(&self, changes: &[ChangeMessage]) -> Vec<ChangeMessage> {
        let mut tracking = self.tracking.lock();
        if tracking.loaded_initial_state {
            return changes.to_vec();
        }

        let mut out = Vec::with_capacity(changes.len());
        for change in changes {
            let mut change = change.clone();
            if !tracking.sent_keys.contains(&change.key) {
                match change.change_type {
                    ChangeType::Update => {
                        change.change_type = ChangeType::Insert;
                        change.previous_value = None;
                    }
                    ChangeType::Delete => continue,
                    ChangeType::Insert => {}
                }
                tracking.sent_keys.insert(change.key.clone());
            }
            out.push(change);
        }
        out
    }
}

/// Rewrite changes as seen through `expr`.
///
/// An update entering the filter becomes an insert and an update leaving it
/// becomes a delete of the previous value.
pub fn filter_by_where(expr: &Expr, changes: Vec<ChangeMessage>) -> Vec<ChangeMessage> {
    let mut out = Vec::with_capacity(changes.len());
    for mut change in changes {
        match change.change_type {
            ChangeType::Insert | ChangeType::Delete => {
                if expr.matches(&change.value) {
                    out.push(change);
                }
            }
            ChangeType::Update => {
                let now = expr.matches(&change.value);
                let before = change
                    .previous_value
                    .as_ref()
                    .is_some_and(|p| expr.matches(p));
                match (before, now) {
                    (true, true) => out.push(change),
                    (false, true) => {
                        change.change_type = ChangeType::Insert;
                        out.push(change);
                    }
                    (true, false) => {
                        if let Some(previous) = change.previous_value.take() {
                            change.change_type = ChangeType::Delete;
                            change.value = previous;
                            out.push(change);
                        }
                    }
                    (false, false) => {}
                }
            }
        }
    }
    out
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
    collection: Collection,
    active: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("collection", &self.collection.id())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(shared: Arc<SubscriptionShared>, collection: Collection) -> Self {
        Self {
            shared,
            collection,
            active: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn has_loaded_initial_state(&self) -> bool {
        self.shared.tracking.lock().loaded_initial_state
    }

    pub fn has_sent_snapshot(&self) -> bool {
        self.shared.tracking.lock().snapshot_sent
    }

    /// Use `index` for [`Subscription::request_limited_snapshot`].
    pub fn set_order_by_index(&self, index: IndexHandle) {
        self.shared.tracking.lock().order_by_index = Some(index);
    }

    /// Send current state not yet delivered.
    ///
    /// Without a request the full state is sent and later changes are no
    /// longer filtered. Returns `false` when the full state was already sent
    /// or when `optimized_only` was requested and no index covers the filter.
    pub fn request_snapshot(&self, request: Option<SnapshotRequest>) -> Result<bool> {
        let _turn = self.collection.turn();

        let mut where_expr = self.shared.where_expr.clone();
        let mut optimized_only = false;
        {
            let mut tracking = self.shared.tracking.lock();
            if tracking.loaded_initial_state {
                return Ok(false);
            }
            match request {
                Some(request) => {
                    optimized_only = request.optimized_only;
                    if let Some(extra) = request.where_expr {
                        where_expr = Some(match where_expr {
                            Some(own) => and(vec![own, extra]),
                            None => extra,
                        });
                    }
                }
                None => tracking.loaded_initial_state = true,
            }
        }

        self.collection.load_subset(LoadSubsetOptions {
            where_expr: where_expr.clone(),
            ..Default::default()
        })?;

        let Some(snapshot) = self.collection.current_state_as_changes(CurrentStateOptions {
            where_expr,
            optimized_only,
            ..Default::default()
        })?
        else {
            return Ok(false);
        };

        let unsent: Vec<ChangeMessage> = {
            let mut tracking = self.shared.tracking.lock();
            tracking.snapshot_sent = true;
            snapshot
                .into_iter()
                .filter(|c| !tracking.sent_keys.contains(&c.key))
                .collect()
        };
        self.shared.send(&unsent);
        Ok(true)
    }

    /// Send up to `limit` unsent rows matching the subscription filter, in
    /// the order of the order-by index, then ask the backend for more.
    pub fn request_limited_snapshot(&self, request: LimitedSnapshotRequest) -> Result<()> {
        if request.limit == 0 {
            return Err(Error::LimitRequired);
        }
        let _turn = self.collection.turn();

        let (index, sent) = {
            let tracking = self.shared.tracking.lock();
            let index = tracking
                .order_by_index
                .clone()
                .ok_or(Error::MissingOrderByIndex)?;
            (index, tracking.sent_keys.clone())
        };

        let changes = self.collection.limited_snapshot(
            &index,
            request.limit,
            request.min_value.as_ref(),
            self.shared.where_expr.as_ref(),
            &sent,
        )?;
        self.shared.tracking.lock().snapshot_sent = true;
        self.shared.send(&changes);

        let mut where_expr = self.shared.where_expr.clone();
        if let Some(min) = request.min_value {
            let expression = request.order_by.expression.clone();
            let bound = match request.order_by.options.direction {
                Direction::Asc => gt(expression, val(min)),
                Direction::Desc => lt(expression, val(min)),
            };
            where_expr = Some(match where_expr {
                Some(own) => and(vec![own, bound]),
                None => bound,
            });
        }
        self.collection.load_subset(LoadSubsetOptions {
            where_expr,
            order_by: Some(request.order_by),
            limit: Some(request.limit),
        })
    }

    /// Stop receiving changes.
    pub fn unsubscribe(mut self) -> Result<()> {
        self.active = false;
        self.collection.remove_subscriber(&self.shared.id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(e) = self.collection.remove_subscriber(&self.shared.id) {
            tracing::error!(subscription = %self.shared.id, error = %e, "failed to unsubscribe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{eq, field};
    use serde_json::json;

    fn recording() -> (ChangeCallback, Arc<Mutex<Vec<Vec<ChangeMessage>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ChangeCallback = Arc::new(move |changes: &[ChangeMessage]| {
            sink.lock().push(changes.to_vec());
        });
        (callback, seen)
    }

    #[test]
    fn unseen_updates_flip_and_unseen_deletes_drop() {
        let (callback, seen) = recording();
        let shared = SubscriptionShared::new(callback, None);

        shared.emit_events(&[
            ChangeMessage::update("a".into(), json!({"n": 2}), json!({"n": 1})),
            ChangeMessage::delete("b".into(), json!({"n": 1})),
        ]);
        shared.emit_events(&[ChangeMessage::update(
            "a".into(),
            json!({"n": 3}),
            json!({"n": 2}),
        )]);

        let batches = seen.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].change_type, ChangeType::Insert);
        assert_eq!(batches[0][0].previous_value, None);
        assert_eq!(batches[1][0].change_type, ChangeType::Update);
    }

    #[test]
    fn where_filter_rewrites_updates() {
        let expr = eq(field("done"), val(false));
        let changes = vec![
            ChangeMessage::update("a".into(), json!({"done": true}), json!({"done": false})),
            ChangeMessage::update("b".into(), json!({"done": false}), json!({"done": true})),
            ChangeMessage::update("c".into(), json!({"done": true}), json!({"done": true})),
            ChangeMessage::delete("d".into(), json!({"done": false})),
        ];

        let out = filter_by_where(&expr, changes);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].change_type, ChangeType::Delete);
        assert_eq!(out[0].value, json!({"done": false}));
        assert_eq!(out[1].change_type, ChangeType::Insert);
        assert_eq!(out[2].key, Key::from("d"));
    }

    #[test]
    fn empty_batch_is_delivered_as_ready_signal() {
        let (callback, seen) = recording();
        let shared = SubscriptionShared::new(callback, Some(eq(field("x"), val(1))));

        shared.emit_events(&[]);
        shared.emit_events(&[ChangeMessage::insert("a".into(), json!({"x": 2}))]);

        let batches = seen.lock();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());
    }
}
