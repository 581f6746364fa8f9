//! Sync protocol between a collection and its backend.
//!
//! A [`SyncSource`] is started once per sync session and receives a
//! [`SyncWriter`]. It pushes server state into the collection in
//! transactions:
//!
//! ```text
//! begin -> write* -> commit        (any number of times)
//! begin -> truncate -> write* -> commit
//! mark_ready                       (once the initial data is in)
//! ```
//!
//! The writer only holds a weak reference to the collection. After the
//! session is cleaned up, calls from the old writer are ignored.

use crate::index_manager::OrderBy;
use crate::{
    error::Result, ChangeType, CollectionId, Expr, Key, MutationFn, MutationType, Transaction,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};

/// How an update from sync is applied to the synced row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowUpdateMode {
    /// Shallow-merge the update into the existing row.
    #[default]
    Partial,
    /// Replace the row.
    Full,
}

/// One write pushed by a sync source.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub kind: ChangeType,
    pub value: Value,
    /// Explicit key; when absent the collection's key extractor is used.
    pub key: Option<Key>,
    pub metadata: Option<Value>,
}

impl SyncMessage {
    pub fn insert(value: Value) -> Self {
        Self::new(ChangeType::Insert, value)
    }

    pub fn update(value: Value) -> Self {
        Self::new(ChangeType::Update, value)
    }

    pub fn delete(value: Value) -> Self {
        Self::new(ChangeType::Delete, value)
    }

    /// Delete addressed by key only.
    pub fn delete_key(key: impl Into<Key>) -> Self {
        Self::new(ChangeType::Delete, Value::Null).with_key(key)
    }

    fn new(kind: ChangeType, value: Value) -> Self {
        Self {
            kind,
            value,
            key: None,
            metadata: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Request for the backend to load a subset of rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSubsetOptions {
    pub where_expr: Option<Expr>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

pub type LoadSubsetFn = Arc<dyn Fn(LoadSubsetOptions) -> Result<()> + Send + Sync>;

type CleanupFn = Box<dyn FnOnce() + Send>;

/// What a started sync source hands back to the collection.
#[derive(Default)]
pub struct SyncSession {
    cleanup: Option<CleanupFn>,
    load_subset: Option<LoadSubsetFn>,
}

impl SyncSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` when the collection is cleaned up.
    pub fn with_cleanup(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.cleanup = Some(Box::new(f));
        self
    }

    pub fn with_load_subset(mut self, f: LoadSubsetFn) -> Self {
        self.load_subset = Some(f);
        self
    }

    pub(crate) fn into_parts(self) -> (Option<CleanupFn>, Option<LoadSubsetFn>) {
        (self.cleanup, self.load_subset)
    }
}

/// Backend that feeds a collection.
pub trait SyncSource: Send + Sync {
    /// Start a session. Called without any collection lock held, so the
    /// source may write through `writer` before returning.
    fn start(&self, writer: SyncWriter) -> Result<SyncSession>;
}

/// Receiving end of a [`SyncWriter`].
pub(crate) trait SyncTarget: Send + Sync {
    fn sync_begin(&self, generation: u64) -> Result<()>;
    fn sync_write(&self, generation: u64, message: SyncMessage) -> Result<()>;
    fn sync_commit(&self, generation: u64) -> Result<()>;
    fn sync_truncate(&self, generation: u64) -> Result<()>;
    fn sync_mark_ready(&self, generation: u64) -> Result<()>;
}

/// Handle a sync source uses to push state into a collection.
#[derive(Clone)]
pub struct SyncWriter {
    target: Weak<dyn SyncTarget>,
    generation: u64,
    collection_id: CollectionId,
}

impl std::fmt::Debug for SyncWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWriter")
            .field("collection_id", &self.collection_id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl SyncWriter {
    pub(crate) fn new(
        target: Weak<dyn SyncTarget>,
        generation: u64,
        collection_id: CollectionId,
    ) -> Self {
        Self {
            target,
            generation,
            collection_id,
        }
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    fn with_target(&self, f: impl FnOnce(&dyn SyncTarget) -> Result<()>) -> Result<()> {
        match self.target.upgrade() {
            Some(target) => f(target.as_ref()),
            None => Ok(()),
        }
    }

    /// Open a sync transaction.
    pub fn begin(&self) -> Result<()> {
        self.with_target(|t| t.sync_begin(self.generation))
    }

    /// Buffer a write in the open sync transaction.
    pub fn write(&self, message: SyncMessage) -> Result<()> {
        self.with_target(|t| t.sync_write(self.generation, message))
    }

    /// Commit the open sync transaction.
    pub fn commit(&self) -> Result<()> {
        self.with_target(|t| t.sync_commit(self.generation))
    }

    /// Clear synced state as part of the open sync transaction.
    pub fn truncate(&self) -> Result<()> {
        self.with_target(|t| t.sync_truncate(self.generation))
    }

    /// Signal that the initial data has been delivered.
    pub fn mark_ready(&self) -> Result<()> {
        self.with_target(|t| t.sync_mark_ready(self.generation))
    }
}

/// Sync source for collections without a backend.
///
/// Starts ready, optionally seeded with initial rows, and echoes committed
/// transactions into the synced state through [`LocalOnlySource::mutation_fn`].
#[derive(Clone, Default)]
pub struct LocalOnlySource {
    initial: Vec<Value>,
    writer: Arc<Mutex<Option<SyncWriter>>>,
}

impl LocalOnlySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_data(mut self, rows: Vec<Value>) -> Self {
        self.initial = rows;
        self
    }

    /// Write the mutations of `transaction` that target this collection into
    /// synced state.
    pub fn confirm(&self, transaction: &Transaction) -> Result<()> {
        let Some(writer) = self.writer.lock().clone() else {
            return Ok(());
        };
        let mutations: Vec<_> = transaction
            .mutations()
            .into_iter()
            .filter(|m| m.collection_id == writer.collection_id)
            .collect();
        if mutations.is_empty() {
            return Ok(());
        }

        writer.begin()?;
        for m in mutations {
            let message = match m.mutation_type {
                MutationType::Insert => SyncMessage::insert(m.modified.unwrap_or(Value::Null)),
                MutationType::Update => SyncMessage::update(m.modified.unwrap_or(Value::Null)),
                MutationType::Delete => SyncMessage::delete(m.original.unwrap_or(Value::Null)),
            };
            writer.write(message.with_key(m.key))?;
        }
        writer.commit()
    }

    /// Mutation handler that confirms the transaction locally.
    pub fn mutation_fn(&self) -> MutationFn {
        let source = self.clone();
        crate::transaction::mutation_fn(move |params| {
            let source = source.clone();
            async move {
                source
                    .confirm(&params.transaction)
                    .map_err(|e| crate::ExecutionError::non_retriable(e.to_string()))
            }
        })
    }
}

impl SyncSource for LocalOnlySource {
    fn start(&self, writer: SyncWriter) -> Result<SyncSession> {
        if !self.initial.is_empty() {
            writer.begin()?;
            for row in &self.initial {
                writer.write(SyncMessage::insert(row.clone()))?;
            }
            writer.commit()?;
        }
        writer.mark_ready()?;
        *self.writer.lock() = Some(writer);

        let slot = self.writer.clone();
        Ok(SyncSession::new().with_cleanup(move || {
            slot.lock().take();
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl SyncTarget for Recorder {
        fn sync_begin(&self, generation: u64) -> Result<()> {
            self.calls.lock().push(format!("begin:{generation}"));
            Ok(())
        }
        fn sync_write(&self, _generation: u64, message: SyncMessage) -> Result<()> {
            if message.key.is_none() && message.value.is_null() {
                return Err(Error::UndefinedKey("null".into()));
            }
            self.calls.lock().push("write".into());
            Ok(())
        }
        fn sync_commit(&self, _generation: u64) -> Result<()> {
            self.calls.lock().push("commit".into());
            Ok(())
        }
        fn sync_truncate(&self, _generation: u64) -> Result<()> {
            self.calls.lock().push("truncate".into());
            Ok(())
        }
        fn sync_mark_ready(&self, _generation: u64) -> Result<()> {
            self.calls.lock().push("ready".into());
            Ok(())
        }
    }

    #[test]
    fn writer_forwards_with_generation() {
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        let target: Arc<dyn SyncTarget> = recorder.clone();
        let writer = SyncWriter::new(Arc::downgrade(&target), 3, "todos".into());

        writer.begin().unwrap();
        writer.write(SyncMessage::insert(serde_json::json!({"id": 1}))).unwrap();
        assert!(writer.write(SyncMessage::insert(Value::Null)).is_err());
        writer.commit().unwrap();
        writer.mark_ready().unwrap();
        assert_eq!(writer.collection_id(), "todos");
        assert_eq!(
            *recorder.calls.lock(),
            vec!["begin:3", "write", "commit", "ready"]
        );
    }

    #[test]
    fn writer_is_inert_once_target_is_gone() {
        let recorder: Arc<dyn SyncTarget> = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        let writer = SyncWriter::new(Arc::downgrade(&recorder), 1, "todos".into());
        drop(recorder);
        assert!(writer.begin().is_ok());
        assert!(writer.write(SyncMessage::insert(Value::Null)).is_ok());
    }

    #[test]
    fn delete_by_key_message() {
        let msg = SyncMessage::delete_key("a").with_metadata(serde_json::json!({"v": 1}));
        assert_eq!(msg.kind, ChangeType::Delete);
        assert_eq!(msg.key, Some(Key::from("a")));
        assert!(msg.metadata.is_some());
    }
}
