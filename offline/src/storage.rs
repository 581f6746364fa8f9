//! Durable key-value storage for the outbox.
//!
//! Adapters store opaque JSON documents under string keys. [`MemoryStorage`]
//! keeps them in process (clones share the same map, so two executors can
//! stand in for two tabs of one application). [`FileStorage`] writes one
//! file per key.

use crate::error::StorageError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

type StorageResult<T> = std::result::Result<T, StorageError>;

/// Persistent storage for outbox entries.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Check that the storage can be written.
    async fn probe(&self) -> StorageResult<()>;

    /// All stored `(key, document)` pairs, in key order.
    async fn list(&self) -> StorageResult<Vec<(String, String)>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn clear(&self) -> StorageResult<()>;
}

/// Outcome classification of the storage probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageDiagnosticCode {
    StorageAvailable,
    StorageBlocked,
    QuotaExceeded,
    UnknownError,
}

/// Result of probing storage during initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDiagnostic {
    pub code: StorageDiagnosticCode,
    pub message: String,
}

impl StorageDiagnostic {
    pub(crate) fn available(message: impl Into<String>) -> Self {
        Self {
            code: StorageDiagnosticCode::StorageAvailable,
            message: message.into(),
        }
    }

    /// Classify a probe failure.
    pub(crate) fn from_probe_error(err: &StorageError) -> Self {
        let (code, message) = match err {
            StorageError::Blocked(_) => (
                StorageDiagnosticCode::StorageBlocked,
                "storage blocked, running in online-only mode",
            ),
            StorageError::QuotaExceeded => (
                StorageDiagnosticCode::QuotaExceeded,
                "storage quota exceeded, running in online-only mode",
            ),
            _ => (
                StorageDiagnosticCode::UnknownError,
                "storage unavailable, running in online-only mode",
            ),
        };
        Self {
            code,
            message: format!("{message}: {err}"),
        }
    }

    pub fn is_available(&self) -> bool {
        self.code == StorageDiagnosticCode::StorageAvailable
    }
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, String>,
    probe_error: Option<StorageError>,
    write_error: Option<StorageError>,
}

/// In-memory storage. Clones share the same entries.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later probe fail with `error`.
    pub fn fail_probe(&self, error: StorageError) {
        self.state.lock().probe_error = Some(error);
    }

    /// Make writes fail with `error` until [`MemoryStorage::heal`] is called.
    pub fn fail_writes(&self, error: StorageError) {
        self.state.lock().write_error = Some(error);
    }

    /// Clear injected failures.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.probe_error = None;
        state.write_error = None;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(state: &MemoryState) -> StorageResult<()> {
        match &state.write_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn probe(&self) -> StorageResult<()> {
        match &self.state.lock().probe_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn list(&self) -> StorageResult<Vec<(String, String)>> {
        Ok(self
            .state
            .lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        state.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        state.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        state.entries.clear();
        Ok(())
    }
}

const ENTRY_EXTENSION: &str = "json";
const PROBE_FILE: &str = ".probe";

/// Stores each entry as `<dir>/<key>.json`.
///
/// Writes go to a temporary file that is renamed into place, so a crash
/// never leaves a half-written entry behind.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> StorageResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::Io(format!("invalid storage key {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.{ENTRY_EXTENSION}")))
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        self.sync_dir().await
    }

    /// Flush the directory so a completed rename survives a crash.
    async fn sync_dir(&self) -> StorageResult<()> {
        #[cfg(unix)]
        tokio::fs::File::open(&self.dir).await?.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for FileStorage {
    async fn probe(&self) -> StorageResult<()> {
        let path = self.dir.join(PROBE_FILE);
        self.write_atomic(&path, b"ok").await?;
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<(String, String)>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let contents = tokio::fs::read_to_string(&path).await?;
            entries.push((key.to_string(), contents));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.entry_path(key)?;
        self.write_atomic(&path, value.as_bytes()).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.entry_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> StorageResult<()> {
        for (key, _) in self.list().await? {
            self.delete(&key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_is_shared_between_clones() {
        let a = MemoryStorage::new();
        let b = a.clone();
        a.put("one", "1").await.unwrap();
        assert_eq!(b.list().await.unwrap(), vec![("one".to_string(), "1".to_string())]);
        b.delete("one").await.unwrap();
        assert!(a.is_empty());
    }

    #[tokio::test]
    async fn memory_storage_failure_injection() {
        let storage = MemoryStorage::new();
        storage.fail_writes(StorageError::QuotaExceeded);
        assert_eq!(storage.put("k", "v").await, Err(StorageError::QuotaExceeded));
        storage.heal();
        storage.put("k", "v").await.unwrap();

        storage.fail_probe(StorageError::Blocked("private mode".into()));
        assert!(storage.probe().await.is_err());
    }

    #[tokio::test]
    async fn file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("outbox"));

        assert!(storage.list().await.unwrap().is_empty());
        storage.probe().await.unwrap();

        storage.put("b-2", "{\"n\":2}").await.unwrap();
        storage.put("a-1", "{\"n\":1}").await.unwrap();
        storage.put("a-1", "{\"n\":3}").await.unwrap();

        let listed = storage.list().await.unwrap();
        assert_eq!(
            listed,
            vec![
                ("a-1".to_string(), "{\"n\":3}".to_string()),
                ("b-2".to_string(), "{\"n\":2}".to_string()),
            ]
        );

        storage.delete("a-1").await.unwrap();
        storage.delete("a-1").await.unwrap();
        storage.clear().await.unwrap();
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_storage_writes_are_complete_on_return() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("outbox"));
        storage.put("entry", "{\"n\":1}").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(storage.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("entry.{ENTRY_EXTENSION}")]);

        let reopened = FileStorage::new(storage.dir());
        assert_eq!(
            reopened.list().await.unwrap(),
            vec![("entry".to_string(), "{\"n\":1}".to_string())]
        );
    }

    #[tokio::test]
    async fn file_storage_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage.put("../escape", "{}").await.is_err());
    }

    #[test]
    fn probe_errors_are_classified() {
        let blocked = StorageDiagnostic::from_probe_error(&StorageError::Blocked("x".into()));
        assert_eq!(blocked.code, StorageDiagnosticCode::StorageBlocked);
        let quota = StorageDiagnostic::from_probe_error(&StorageError::QuotaExceeded);
        assert_eq!(quota.code, StorageDiagnosticCode::QuotaExceeded);
        let io = StorageDiagnostic::from_probe_error(&StorageError::Io("disk".into()));
        assert_eq!(io.code, StorageDiagnosticCode::UnknownError);
        assert!(!io.is_available());
    }
}
