//! Shared helpers for offline queue tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use stowage_engine::{
    key_field, Collection, CollectionConfig, ExecutionError, LocalOnlySource, RowUpdateMode,
};
use stowage_offline::{offline_mutation_fn, OfflineMutationFn, RetryPolicy};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fake backend. Successful calls write the transaction's mutations back
/// into the collection's synced state, like a sync echo would.
#[derive(Clone, Default)]
pub struct Backend {
    source: LocalOnlySource,
    calls: Arc<Mutex<Vec<(String, String)>>>,
    script: Arc<Mutex<VecDeque<Result<(), ExecutionError>>>>,
}

impl Backend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collection named `todos` synced by this backend.
    pub fn collection(&self) -> Collection {
        Collection::new(
            CollectionConfig::new(key_field("id"))
                .with_id("todos")
                .with_row_update_mode(RowUpdateMode::Full)
                .with_sync(Arc::new(self.source.clone()))
                .start_sync(),
        )
        .unwrap()
    }

    /// Queue outcomes for the next calls. Calls beyond the script succeed.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), ExecutionError>>) {
        self.script.lock().extend(outcomes);
    }

    /// `(transaction id, idempotency key)` of every call, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn mutation_fn(&self) -> OfflineMutationFn {
        let backend = self.clone();
        offline_mutation_fn(move |params| {
            let backend = backend.clone();
            async move {
                backend.calls.lock().push((
                    params.transaction.id().to_string(),
                    params.idempotency_key.clone(),
                ));
                let outcome = backend.script.lock().pop_front().unwrap_or(Ok(()));
                outcome?;
                backend
                    .source
                    .confirm(&params.transaction)
                    .map_err(|e| ExecutionError::non_retriable(e.to_string()))?;
                Ok::<Value, ExecutionError>(json!({"applied": params.transaction.mutations().len()}))
            }
        })
    }
}

pub fn fast_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: false,
    }
}

pub fn todo(id: i64, title: &str) -> Value {
    json!({"id": id, "title": title})
}

/// Poll `condition` until it holds, failing after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
