//! Write leadership between instances sharing one outbox.
//!
//! Only the leader drains the outbox. Other instances execute their
//! transactions directly.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

/// Elects the single instance allowed to drain the outbox.
#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Try to become leader. Returns whether this instance now leads.
    async fn request_leadership(&self) -> bool;

    async fn release_leadership(&self);

    fn is_leader(&self) -> bool;

    /// Receiver observing leadership changes.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Leadership for a process that never shares its outbox.
#[derive(Debug)]
pub struct AlwaysLeader {
    tx: watch::Sender<bool>,
}

impl AlwaysLeader {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx }
    }
}

impl Default for AlwaysLeader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaderElection for AlwaysLeader {
    async fn request_leadership(&self) -> bool {
        true
    }

    async fn release_leadership(&self) {}

    fn is_leader(&self) -> bool {
        true
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Leadership flipped by hand. Clones share the same flag.
#[derive(Debug, Clone)]
pub struct ManualLeaderElection {
    tx: Arc<watch::Sender<bool>>,
}

impl ManualLeaderElection {
    pub fn new(leader: bool) -> Self {
        let (tx, _) = watch::channel(leader);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_leader(&self, leader: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != leader;
            *current = leader;
            changed
        });
    }
}

#[async_trait]
impl LeaderElection for ManualLeaderElection {
    async fn request_leadership(&self) -> bool {
        *self.tx.borrow()
    }

    async fn release_leadership(&self) {
        self.set_leader(false);
    }

    fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_election_notifies_changes() {
        let election = ManualLeaderElection::new(false);
        let mut rx = election.subscribe();
        assert!(!election.request_leadership().await);

        election.set_leader(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        election.set_leader(true);
        assert!(!rx.has_changed().unwrap());

        election.release_leadership().await;
        assert!(!election.is_leader());
    }

    #[tokio::test]
    async fn always_leader_leads() {
        let election = AlwaysLeader::new();
        assert!(election.request_leadership().await);
        election.release_leadership().await;
        assert!(election.is_leader());
    }
}
