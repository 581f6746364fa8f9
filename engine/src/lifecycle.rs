//! Collection status and its transition rules.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};

/// Status of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionStatus {
    /// Created, sync not started.
    Idle,
    /// Sync started, initial data not yet marked ready.
    Loading,
    Ready,
    Error,
    /// Resources released; the next use restarts sync.
    CleanedUp,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStatus::Idle => "idle",
            CollectionStatus::Loading => "loading",
            CollectionStatus::Ready => "ready",
            CollectionStatus::Error => "error",
            CollectionStatus::CleanedUp => "cleaned-up",
        }
    }

    /// Whether `self -> next` is allowed. Staying in place always is.
    pub fn can_transition_to(self, next: CollectionStatus) -> bool {
        use CollectionStatus::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Loading | Error | CleanedUp)
                | (Loading, Ready | Error | CleanedUp)
                | (Ready, CleanedUp | Error)
                | (Error, CleanedUp | Idle)
                | (CleanedUp, Loading | Error)
        )
    }
}

impl std::fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Mutable lifecycle bookkeeping, guarded by the collection core lock.
pub(crate) struct Lifecycle {
    status: CollectionStatus,
    has_been_ready: bool,
    first_ready: Vec<ReadyCallback>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            status: CollectionStatus::Idle,
            has_been_ready: false,
            first_ready: Vec::new(),
        }
    }
}

impl Lifecycle {
    pub fn status(&self) -> CollectionStatus {
        self.status
    }

    pub fn has_been_ready(&self) -> bool {
        self.has_been_ready
    }

    /// Move to `next`, returning the previous status.
    pub fn set_status(&mut self, next: CollectionStatus) -> Result<CollectionStatus> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStatusTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        Ok(std::mem::replace(&mut self.status, next))
    }

    /// Queue a callback for the first time the collection becomes ready.
    ///
    /// Returns the callback back when the collection has already been ready,
    /// so the caller can run it outside of any lock.
    pub fn on_first_ready(&mut self, callback: ReadyCallback) -> Option<ReadyCallback> {
        if self.has_been_ready {
            return Some(callback);
        }
        self.first_ready.push(callback);
        None
    }

    /// Record the first transition into ready, handing back queued callbacks.
    pub fn take_first_ready(&mut self) -> Vec<ReadyCallback> {
        if self.has_been_ready {
            return Vec::new();
        }
        self.has_been_ready = true;
        std::mem::take(&mut self.first_ready)
    }

    /// Forget readiness after cleanup.
    pub fn reset(&mut self) {
        self.has_been_ready = false;
    }
}
