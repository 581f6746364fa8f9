//! Error types for the offline queue.

use stowage_engine::ExecutionError;

/// Failure of a storage adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("storage blocked: {0}")]
    Blocked(String),

    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("corrupt outbox entry {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => StorageError::Blocked(err.to_string()),
            std::io::ErrorKind::StorageFull => StorageError::QuotaExceeded,
            _ => StorageError::Io(err.to_string()),
        }
    }
}

/// Errors raised by the offline executor and its transactions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OfflineError {
    #[error("engine error: {0}")]
    Engine(#[from] stowage_engine::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("mutation function failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("unknown mutation function: {0}")]
    UnknownMutationFn(String),

    #[error("offline executor has been disposed")]
    Disposed,

    #[error("transaction {0} is not tracked by the offline executor")]
    TransactionNotFound(String),
}

/// Result type for offline queue operations.
pub type Result<T> = std::result::Result<T, OfflineError>;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{name} must not be greater than {other}")]
    OutOfOrder {
        name: &'static str,
        other: &'static str,
    },
}
