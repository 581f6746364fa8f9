//! Offline executor configuration.

use crate::leader::{AlwaysLeader, LeaderElection};
use crate::online::OnlineDetector;
use crate::outbox::OutboxEntry;
use crate::retry::RetryPolicy;
use crate::storage::{StorageAdapter, StorageDiagnostic};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use stowage_engine::{Collection, ExecutionError, Transaction};

/// Arguments handed to a named mutation function.
#[derive(Clone)]
pub struct MutationFnParams {
    pub transaction: Transaction,
    /// Stable across retries and restarts, so the backend can deduplicate.
    pub idempotency_key: String,
}

/// Remote execution function for queued transactions.
pub type OfflineMutationFn = Arc<
    dyn Fn(MutationFnParams) -> BoxFuture<'static, Result<Value, ExecutionError>> + Send + Sync,
>;

/// Wrap an async closure as an [`OfflineMutationFn`].
pub fn offline_mutation_fn<F, Fut>(f: F) -> OfflineMutationFn
where
    F: Fn(MutationFnParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(f(params)))
}

pub type LeadershipCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type StorageFailureCallback = Arc<dyn Fn(&StorageDiagnostic) + Send + Sync>;
pub type UnknownMutationFnCallback = Arc<dyn Fn(&str, &OutboxEntry) + Send + Sync>;

/// How the executor obtains its storage.
#[derive(Clone)]
pub(crate) enum StorageChoice {
    /// Used as given, without probing.
    Trusted(Arc<dyn StorageAdapter>),
    /// Probed on start; a failed probe selects online-only mode.
    Probed(Arc<dyn StorageAdapter>),
}

/// Configuration for [`crate::OfflineExecutor::start`].
#[derive(Clone)]
pub struct OfflineConfig {
    pub(crate) collections: HashMap<String, Collection>,
    pub(crate) mutation_fns: HashMap<String, OfflineMutationFn>,
    pub(crate) storage: StorageChoice,
    pub(crate) leader_election: Arc<dyn LeaderElection>,
    pub(crate) online_detector: OnlineDetector,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) offline_enabled: bool,
    pub(crate) on_leadership_change: Option<LeadershipCallback>,
    pub(crate) on_storage_failure: Option<StorageFailureCallback>,
    pub(crate) on_unknown_mutation_fn: Option<UnknownMutationFnCallback>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            collections: HashMap::new(),
            mutation_fns: HashMap::new(),
            storage: StorageChoice::Probed(Arc::new(crate::storage::MemoryStorage::new())),
            leader_election: Arc::new(AlwaysLeader::new()),
            online_detector: OnlineDetector::new(),
            retry_policy: RetryPolicy::default(),
            offline_enabled: true,
            on_leadership_change: None,
            on_storage_failure: None,
            on_unknown_mutation_fn: None,
        }
    }
}

impl OfflineConfig {
    /// An in-memory outbox led by this process alone.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection that queued mutations may target.
    pub fn with_collection(mut self, collection: Collection) -> Self {
        self.collections.insert(collection.id().to_string(), collection);
        self
    }

    pub fn with_mutation_fn(mut self, name: impl Into<String>, f: OfflineMutationFn) -> Self {
        self.mutation_fns.insert(name.into(), f);
        self
    }

    /// Use `storage` without probing it.
    pub fn with_storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = StorageChoice::Trusted(storage);
        self
    }

    /// Use `storage` if it passes a probe, otherwise run online-only.
    pub fn with_probed_storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = StorageChoice::Probed(storage);
        self
    }

    pub fn with_leader_election(mut self, election: Arc<dyn LeaderElection>) -> Self {
        self.leader_election = election;
        self
    }

    pub fn with_online_detector(mut self, detector: OnlineDetector) -> Self {
        self.online_detector = detector;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Bypass the outbox even when this instance leads.
    pub fn offline_disabled(mut self) -> Self {
        self.offline_enabled = false;
        self
    }

    pub fn on_leadership_change(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_leadership_change = Some(Arc::new(f));
        self
    }

    pub fn on_storage_failure(
        mut self,
        f: impl Fn(&StorageDiagnostic) + Send + Sync + 'static,
    ) -> Self {
        self.on_storage_failure = Some(Arc::new(f));
        self
    }

    pub fn on_unknown_mutation_fn(
        mut self,
        f: impl Fn(&str, &OutboxEntry) + Send + Sync + 'static,
    ) -> Self {
        self.on_unknown_mutation_fn = Some(Arc::new(f));
        self
    }
}
