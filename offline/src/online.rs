//! Connectivity signal.

use std::sync::Arc;
use tokio::sync::watch;

/// Tracks whether the backend is reachable. Clones share the same state.
///
/// Every transition to online, and every [`OnlineDetector::notify_online`],
/// is observed by subscribers even when the state was already online.
#[derive(Debug, Clone)]
pub struct OnlineDetector {
    tx: Arc<watch::Sender<bool>>,
}

impl OnlineDetector {
    /// A detector that starts online.
    pub fn new() -> Self {
        Self::with_state(true)
    }

    pub fn with_state(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Signal that connectivity was (re)established.
    pub fn notify_online(&self) {
        self.tx.send_modify(|online| *online = true);
    }

    pub fn set_online(&self, online: bool) {
        if online {
            self.notify_online();
        } else {
            self.tx.send_if_modified(|current| std::mem::replace(current, false));
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for OnlineDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_online_wakes_even_when_online() {
        let detector = OnlineDetector::new();
        let mut rx = detector.subscribe();
        rx.borrow_and_update();

        detector.notify_online();
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
    }

    #[test]
    fn going_offline_twice_notifies_once() {
        let detector = OnlineDetector::new();
        let mut rx = detector.subscribe();
        rx.borrow_and_update();

        detector.set_online(false);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        detector.set_online(false);
        assert!(!rx.has_changed().unwrap());
        assert!(!detector.is_online());
    }
}
