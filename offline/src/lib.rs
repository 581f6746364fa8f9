//! # Stowage Offline
//!
//! A durable execution queue for stowage transactions.
//!
//! Transactions created through an [`OfflineExecutor`] are written to an
//! outbox when committed and executed by named mutation functions, strictly
//! one at a time in commit order. Retriable failures back off and retry
//! while the user keeps seeing the optimistic result; permanent failures
//! roll the transaction back. After a restart the outbox is replayed and
//! its optimistic state restored before the executor is handed out.
//!
//! Only the elected leader drains the outbox. Followers, and executors
//! without usable storage, execute transactions directly.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use stowage_engine::{key_field, Collection, CollectionConfig, ExecutionError};
//! use stowage_offline::{offline_mutation_fn, OfflineConfig, OfflineExecutor, OfflineTransactionConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let todos = Collection::new(CollectionConfig::local_only(key_field("id"), vec![]).with_id("todos"))?;
//!
//! let executor = OfflineExecutor::start(
//!     OfflineConfig::new()
//!         .with_collection(todos.clone())
//!         .with_mutation_fn("sync_todos", offline_mutation_fn(|params| async move {
//!             // send params.transaction.mutations() to the backend
//!             Ok::<_, ExecutionError>(json!({"accepted": params.transaction.mutations().len()}))
//!         })),
//! )
//! .await?;
//!
//! let tx = executor.create_offline_transaction(OfflineTransactionConfig::new("sync_todos"))?;
//! tx.insert(&todos, json!({"id": 1, "title": "buy milk"}))?;
//! let result = tx.commit().await?.wait().await?;
//! assert_eq!(result["accepted"], 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod leader;
pub mod online;
pub mod outbox;
pub mod retry;
pub mod storage;
pub mod transaction;

pub use config::{offline_mutation_fn, MutationFnParams, OfflineConfig, OfflineMutationFn};
pub use error::{ConfigError, OfflineError, Result, StorageError};
pub use executor::{Completion, OfflineExecutor, OfflineMode};
pub use leader::{AlwaysLeader, LeaderElection, ManualLeaderElection};
pub use online::OnlineDetector;
pub use outbox::{Outbox, OutboxEntry};
pub use retry::{RetryPolicy, RetrySettings};
pub use storage::{
    FileStorage, MemoryStorage, StorageAdapter, StorageDiagnostic, StorageDiagnosticCode,
};
pub use transaction::{OfflineTransaction, OfflineTransactionConfig};
