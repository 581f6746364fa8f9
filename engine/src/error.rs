//! Error types for the stowage engine.

use crate::{CollectionId, Key, TransactionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a remote execution failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionErrorKind {
    /// Transient condition (network, offline). The work is kept and retried.
    Retriable,
    /// Permanent rejection. The work is dropped and rolled back.
    NonRetriable,
}

/// Tagged error returned by a remote execution function.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    /// A failure that should be retried later.
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Retriable,
            message: message.into(),
        }
    }

    /// A failure that must not be retried.
    pub fn non_retriable(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::NonRetriable,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind == ExecutionErrorKind::Retriable
    }
}

/// A single schema validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// Dotted path of the offending field, empty for the whole item.
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// All possible errors from the stowage engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Configuration errors
    #[error("collection requires a key extractor")]
    MissingKeyExtractor,

    #[error("gc time exceeds the maximum of 2147483647 ms")]
    InvalidGcTime,

    #[error("sync has already been started for collection {0}")]
    SyncAlreadyStarted(CollectionId),

    // Validation errors
    #[error("schema validation failed during {operation}: {}", join_issues(.issues))]
    SchemaValidation {
        operation: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("key extractor returned no key for item: {0}")]
    UndefinedKey(String),

    #[error("{operation}: key not found: {key}")]
    KeyNotFound { operation: String, key: Key },

    #[error("cannot insert item with key {0}: key already exists")]
    DuplicateKey(Key),

    #[error("updating the key of an item is not allowed ({from} -> {to})")]
    KeyUpdateNotAllowed { from: Key, to: Key },

    #[error("cannot apply {incoming} after {existing} on key {key} in the same transaction")]
    InvalidMutationSequence {
        key: Key,
        existing: String,
        incoming: String,
    },

    #[error("collection {collection} has no {operation} handler and no ambient transaction")]
    MissingHandler {
        collection: CollectionId,
        operation: String,
    },

    // Sync errors
    #[error("no pending sync transaction to write to")]
    NoPendingSyncTransactionWrite,

    #[error("no pending sync transaction to commit")]
    NoPendingSyncTransactionCommit,

    #[error("the pending sync transaction is already committed")]
    SyncTransactionAlreadyCommitted,

    #[error("synced insert for existing key {0} with a different value")]
    DuplicateKeySync(Key),

    // Transaction errors
    #[error("transaction {0} is no longer pending")]
    TransactionNotPending(TransactionId),

    #[error("transaction {0} is already completed and cannot be rolled back")]
    TransactionAlreadyCompleted(TransactionId),

    #[error("transaction {0} was rolled back")]
    TransactionRolledBack(TransactionId),

    // Lifecycle errors
    #[error("invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("collection {0} is in error state")]
    CollectionInErrorState(CollectionId),

    #[error("sync failed: {0}")]
    SyncFailed(String),

    // Subscription and query errors
    #[error("active subscriber count went negative for collection {0}")]
    NegativeSubscriberCount(CollectionId),

    #[error("limited snapshot requires an order-by index")]
    MissingOrderByIndex,

    #[error("limited snapshot requires a non-zero limit")]
    LimitRequired,

    #[error("limit requires an order-by clause")]
    LimitWithoutOrderBy,

    #[error("index {0} not found")]
    IndexNotFound(String),

    // Persistence errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    // Runtime errors
    #[error("no async runtime available to execute the transaction")]
    RuntimeUnavailable,

    #[error("remote execution failed: {0}")]
    Execution(#[from] ExecutionError),
}

impl Error {
    /// Whether this error was raised by a remote execution function and may be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Execution(e) if e.is_retriable())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::KeyNotFound {
            operation: "update".into(),
            key: Key::from("todo-1"),
        };
        assert_eq!(err.to_string(), "update: key not found: todo-1");

        let err = Error::SchemaValidation {
            operation: "insert".into(),
            issues: vec![
                ValidationIssue::new("title", "missing required field"),
                ValidationIssue::new("", "payload must be an object"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "schema validation failed during insert: title: missing required field; payload must be an object"
        );

        let err = Error::DuplicateKey(Key::Int(7));
        assert_eq!(err.to_string(), "cannot insert item with key 7: key already exists");
    }

    #[test]
    fn execution_error_kinds() {
        let err: Error = ExecutionError::retriable("offline").into();
        assert!(err.is_retriable());
        assert_eq!(err.to_string(), "remote execution failed: offline");

        let err: Error = ExecutionError::non_retriable("rejected").into();
        assert!(!err.is_retriable());
        assert!(!Error::LimitRequired.is_retriable());
    }
}
