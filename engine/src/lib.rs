//! # Stowage Engine
//!
//! A client-resident collection engine for local-first applications.
//!
//! Collections hold keyed JSON items fed by a backend through a sync
//! protocol. Local writes are staged in optimistic transactions and shown
//! immediately as an overlay over the synced state, then confirmed or rolled
//! back once the backend answers. Subscribers receive change batches that
//! describe exactly what became visible.
//!
//! ## Core Concepts
//!
//! ### Collections
//!
//! A [`Collection`] keeps two layers:
//! - Synced state, written only by its [`SyncSource`] through a [`SyncWriter`]
//! - The optimistic overlay, derived from active [`Transaction`]s
//!
//! Reads always see the overlay on top of synced state.
//!
//! ### Transactions
//!
//! Insert, update and delete stage [`PendingMutation`]s in a transaction.
//! Mutations of the same key collapse, so a transaction holds at most one
//! mutation per key. Committing runs the transaction's [`MutationFn`].
//!
//! ### Subscriptions
//!
//! [`Collection::subscribe_changes`] delivers [`ChangeMessage`] batches,
//! optionally filtered by an [`Expr`]. Updates to keys a subscriber has not
//! seen arrive as inserts, so every subscriber sees a consistent stream.
//!
//! ### Indexes
//!
//! Ordered indexes answer `where` lookups and order-by walks. Single-field
//! predicates of subscription filters get indexes automatically.
//!
//! ## Quick Start
//!
//! ```rust
//! use stowage_engine::{key_field, Collection, CollectionConfig, Key, SubscribeOptions};
//! use serde_json::json;
//!
//! let todos = Collection::new(
//!     CollectionConfig::local_only(key_field("id"), vec![json!({"id": 1, "title": "write docs"})])
//!         .with_id("todos"),
//! )
//! .unwrap();
//!
//! assert!(todos.is_ready());
//! assert_eq!(todos.get(&Key::Int(1)).unwrap()["title"], "write docs");
//!
//! let subscription = todos
//!     .subscribe_changes(|changes| println!("{changes:?}"), SubscribeOptions::default().with_initial_state())
//!     .unwrap();
//! subscription.unsubscribe().unwrap();
//! ```
//!
//! ## Persistence
//!
//! Use [`Collection::export_snapshot`] and [`Collection::import_snapshot`]
//! with [`CollectionSnapshot`]. Snapshots serialize to JSON in key order.

pub mod change;
mod changes;
pub mod collection;
pub mod compare;
pub mod error;
pub mod events;
pub mod expression;
pub mod index;
pub mod index_manager;
pub mod key;
pub mod lifecycle;
pub mod mutation;
pub mod mutations;
pub mod schema;
pub mod snapshot;
mod state;
pub mod subscription;
pub mod sync;
pub mod transaction;

// Re-export main types at crate root
pub use change::{ChangeMessage, ChangeType};
pub use collection::{
    key_field, Collection, CollectionConfig, CurrentStateOptions, IndexHandle, KeyFn,
    DEFAULT_GC_TIME, MAX_GC_TIME,
};
pub use compare::{compare_values, CompareOptions, Direction, Nulls, StringSort};
pub use error::{Error, ExecutionError, ExecutionErrorKind, Result, ValidationIssue};
pub use events::{CollectionEvent, EventHandler, EventKind, ListenerId};
pub use expression::{Comparison, Expr};
pub use index::{BTreeIndex, IndexQuery, IndexStats, RangeQuery, ReverseIndex};
pub use index_manager::{AutoIndex, IndexInfo, IndexOptions, IndexResolver, OrderBy};
pub use key::{GlobalKey, Key};
pub use lifecycle::CollectionStatus;
pub use mutation::{MutationType, PendingMutation};
pub use mutations::OperationConfig;
pub use schema::{CollectionSchema, FieldDef, FieldType, SchemaValidator};
pub use snapshot::{CollectionSnapshot, SnapshotEntry, SNAPSHOT_FORMAT_VERSION};
pub use subscription::{LimitedSnapshotRequest, SnapshotRequest, SubscribeOptions, Subscription};
pub use sync::{
    LoadSubsetFn, LoadSubsetOptions, LocalOnlySource, RowUpdateMode, SyncMessage, SyncSession,
    SyncSource, SyncWriter,
};
pub use transaction::{
    mutation_fn, MutationFn, MutationFnParams, Transaction, TransactionConfig, TransactionState,
};

/// Type aliases for clarity
pub type CollectionId = String;
pub type TransactionId = String;
