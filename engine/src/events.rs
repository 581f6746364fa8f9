//! Typed collection events.
//!
//! Listeners are registered per [`EventKind`] and invoked synchronously,
//! outside of any collection lock.

use crate::{lifecycle::CollectionStatus, CollectionId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    StatusChange {
        collection_id: CollectionId,
        previous: CollectionStatus,
        status: CollectionStatus,
    },
    SubscribersChange {
        collection_id: CollectionId,
        previous: usize,
        active: usize,
    },
    /// A sync transaction cleared the synced state.
    Truncate { collection_id: CollectionId },
    IndexAdded {
        collection_id: CollectionId,
        index_id: u64,
        name: String,
    },
    IndexRemoved {
        collection_id: CollectionId,
        index_id: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StatusChange,
    SubscribersChange,
    Truncate,
    IndexAdded,
    IndexRemoved,
}

impl CollectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CollectionEvent::StatusChange { .. } => EventKind::StatusChange,
            CollectionEvent::SubscribersChange { .. } => EventKind::SubscribersChange,
            CollectionEvent::Truncate { .. } => EventKind::Truncate,
            CollectionEvent::IndexAdded { .. } => EventKind::IndexAdded,
            CollectionEvent::IndexRemoved { .. } => EventKind::IndexRemoved,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&CollectionEvent) + Send + Sync>;

/// Handle returned by `on`, used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct EventBus {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, EventKind, EventHandler)>>,
}

impl EventBus {
    pub fn on(&self, kind: EventKind, handler: EventHandler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, kind, handler));
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _, _)| *lid != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: &CollectionEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}
