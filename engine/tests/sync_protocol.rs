//! Sync protocol tests for stowage-engine
//!
//! A manual sync source hands its writer to the test, which then plays the
//! backend.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stowage_engine::{
    key_field, mutation_fn, ChangeMessage, ChangeType, Collection, CollectionConfig,
    CollectionEvent, CollectionStatus, Error, EventKind, Key, RowUpdateMode, SubscribeOptions,
    SyncMessage, SyncSession, SyncSource, SyncWriter, TransactionState,
};

#[derive(Clone, Default)]
struct ManualSource {
    writer: Arc<Mutex<Option<SyncWriter>>>,
    starts: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
}

impl ManualSource {
    fn writer(&self) -> SyncWriter {
        self.writer.lock().clone().expect("sync not started")
    }
}

impl SyncSource for ManualSource {
    fn start(&self, writer: SyncWriter) -> stowage_engine::Result<SyncSession> {
        *self.writer.lock() = Some(writer);
        self.starts.fetch_add(1, Ordering::SeqCst);
        let cleanups = self.cleanups.clone();
        Ok(SyncSession::new().with_cleanup(move || {
            cleanups.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

fn collection(source: &ManualSource) -> Collection {
    Collection::new(
        CollectionConfig::new(key_field("id"))
            .with_id("todos")
            .with_sync(Arc::new(source.clone()))
            .start_sync(),
    )
    .unwrap()
}

type Batches = Arc<Mutex<Vec<Vec<ChangeMessage>>>>;

fn record(collection: &Collection) -> (stowage_engine::Subscription, Batches) {
    let batches: Batches = Arc::default();
    let sink = batches.clone();
    let subscription = collection
        .subscribe_changes(
            move |changes| {
                if !changes.is_empty() {
                    sink.lock().push(changes.to_vec());
                }
            },
            SubscribeOptions::default().with_initial_state(),
        )
        .unwrap();
    batches.lock().clear();
    (subscription, batches)
}

fn seed(writer: &SyncWriter, rows: &[Value]) {
    writer.begin().unwrap();
    for row in rows {
        writer.write(SyncMessage::insert(row.clone())).unwrap();
    }
    writer.commit().unwrap();
}

// ============================================================================
// Transactions
// ============================================================================

#[test]
fn initial_load_then_ready() {
    let source = ManualSource::default();
    let todos = collection(&source);
    assert_eq!(todos.status(), CollectionStatus::Loading);

    let (_sub, batches) = record(&todos);
    let writer = source.writer();
    seed(&writer, &[json!({"id": 1, "title": "a"}), json!({"id": 2, "title": "b"})]);
    writer.mark_ready().unwrap();

    assert!(todos.is_ready());
    assert_eq!(todos.size(), 2);
    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].iter().all(|c| c.change_type == ChangeType::Insert));
}

#[test]
fn uncommitted_writes_are_invisible() {
    let source = ManualSource::default();
    let todos = collection(&source);
    let writer = source.writer();

    writer.begin().unwrap();
    writer.write(SyncMessage::insert(json!({"id": 1}))).unwrap();
    assert!(!todos.has(&Key::Int(1)));
    writer.commit().unwrap();
    assert!(todos.has(&Key::Int(1)));
}

#[test]
fn protocol_misuse_is_rejected() {
    let source = ManualSource::default();
    let _todos = collection(&source);
    let writer = source.writer();

    assert_eq!(
        writer.write(SyncMessage::insert(json!({"id": 1}))),
        Err(Error::NoPendingSyncTransactionWrite)
    );
    assert_eq!(writer.commit(), Err(Error::NoPendingSyncTransactionCommit));

    writer.begin().unwrap();
    assert!(matches!(
        writer.write(SyncMessage::insert(json!({"title": "no id"}))),
        Err(Error::UndefinedKey(_))
    ));
    writer.commit().unwrap();
    assert_eq!(writer.commit(), Err(Error::NoPendingSyncTransactionCommit));
}

#[test]
fn duplicate_synced_insert() {
    let source = ManualSource::default();
    let todos = collection(&source);
    let writer = source.writer();
    seed(&writer, &[json!({"id": 1, "title": "a"})]);

    let (_sub, batches) = record(&todos);

    // Same value again is an idempotent update and stays silent.
    seed(&writer, &[json!({"id": 1, "title": "a"})]);
    assert!(batches.lock().is_empty());

    writer.begin().unwrap();
    assert_eq!(
        writer.write(SyncMessage::insert(json!({"id": 1, "title": "b"}))),
        Err(Error::DuplicateKeySync(Key::Int(1)))
    );

    // After a delete in the same transaction the insert is allowed.
    writer.write(SyncMessage::delete_key(1)).unwrap();
    writer
        .write(SyncMessage::insert(json!({"id": 1, "title": "b"})))
        .unwrap();
    writer.commit().unwrap();
    assert_eq!(todos.get(&Key::Int(1)).unwrap()["title"], "b");
}

#[test]
fn partial_and_full_row_updates() {
    let source = ManualSource::default();
    let todos = collection(&source);
    let writer = source.writer();
    seed(&writer, &[json!({"id": 1, "title": "a", "done": false})]);

    writer.begin().unwrap();
    writer
        .write(SyncMessage::update(json!({"done": true})).with_key(1))
        .unwrap();
    writer.commit().unwrap();
    assert_eq!(
        todos.get(&Key::Int(1)),
        Some(json!({"id": 1, "title": "a", "done": true}))
    );

    let full_source = ManualSource::default();
    let full = Collection::new(
        CollectionConfig::new(key_field("id"))
            .with_sync(Arc::new(full_source.clone()))
            .with_row_update_mode(RowUpdateMode::Full)
            .start_sync(),
    )
    .unwrap();
    let writer = full_source.writer();
    seed(&writer, &[json!({"id": 1, "title": "a", "done": false})]);
    writer.begin().unwrap();
    writer
        .write(SyncMessage::update(json!({"id": 1, "done": true})))
        .unwrap();
    writer.commit().unwrap();
    assert_eq!(full.get(&Key::Int(1)), Some(json!({"id": 1, "done": true})));
}

// ============================================================================
// Truncate
// ============================================================================

#[test]
fn truncate_replaces_synced_state() {
    let source = ManualSource::default();
    let todos = collection(&source);
    let writer = source.writer();
    seed(&writer, &[json!({"id": 1}), json!({"id": 2})]);

    let truncates = Arc::new(AtomicUsize::new(0));
    let counter = truncates.clone();
    todos.on(
        EventKind::Truncate,
        Arc::new(move |_: &CollectionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let (_sub, batches) = record(&todos);

    writer.begin().unwrap();
    writer.write(SyncMessage::delete_key(2)).unwrap();
    writer.truncate().unwrap();
    writer.write(SyncMessage::insert(json!({"id": 3}))).unwrap();
    writer.commit().unwrap();

    assert_eq!(truncates.load(Ordering::SeqCst), 1);
    assert_eq!(todos.keys(), vec![Key::Int(3)]);

    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    let kinds: Vec<_> = batches[0]
        .iter()
        .map(|c| (c.change_type, c.key.clone()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (ChangeType::Delete, Key::Int(1)),
            (ChangeType::Delete, Key::Int(2)),
            (ChangeType::Insert, Key::Int(3)),
        ]
    );
}

#[test]
fn truncate_marks_loading_collection_ready() {
    let source = ManualSource::default();
    let todos = collection(&source);
    let writer = source.writer();

    writer.begin().unwrap();
    writer.truncate().unwrap();
    writer.commit().unwrap();
    assert!(todos.is_ready());
}

// ============================================================================
// Sessions
// ============================================================================

#[test]
fn cleanup_invalidates_old_writer() {
    let source = ManualSource::default();
    let todos = collection(&source);
    let old = source.writer();
    seed(&old, &[json!({"id": 1})]);
    old.mark_ready().unwrap();

    todos.cleanup().unwrap();
    assert_eq!(todos.status(), CollectionStatus::CleanedUp);
    assert_eq!(todos.size(), 0);
    assert_eq!(source.cleanups.load(Ordering::SeqCst), 1);

    todos.start_sync().unwrap();
    assert_eq!(source.starts.load(Ordering::SeqCst), 2);

    seed(&old, &[json!({"id": 2})]);
    assert!(!todos.has(&Key::Int(2)));

    seed(&source.writer(), &[json!({"id": 3})]);
    assert!(todos.has(&Key::Int(3)));
}

#[test]
fn status_events_follow_transitions() {
    let source = ManualSource::default();
    let todos = Collection::new(
        CollectionConfig::new(key_field("id")).with_sync(Arc::new(source.clone())),
    )
    .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    todos.on(
        EventKind::StatusChange,
        Arc::new(move |event: &CollectionEvent| {
            if let CollectionEvent::StatusChange { status, .. } = event {
                sink.lock().push(*status);
            }
        }),
    );

    let ready = Arc::new(AtomicUsize::new(0));
    let counter = ready.clone();
    todos.on_first_ready(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    todos.start_sync().unwrap();
    source.writer().mark_ready().unwrap();
    source.writer().mark_ready().unwrap();

    assert_eq!(
        *seen.lock(),
        vec![CollectionStatus::Loading, CollectionStatus::Ready]
    );
    assert_eq!(ready.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_source_puts_collection_in_error_state() {
    struct Broken;
    impl SyncSource for Broken {
        fn start(&self, _writer: SyncWriter) -> stowage_engine::Result<SyncSession> {
            Err(Error::SyncFailed("connection refused".into()))
        }
    }

    let todos = Collection::new(CollectionConfig::new(key_field("id")).with_sync(Arc::new(Broken)))
        .unwrap();
    assert!(todos.start_sync().is_err());
    assert_eq!(todos.status(), CollectionStatus::Error);
    assert!(matches!(
        todos.insert(json!({"id": 1})),
        Err(Error::CollectionInErrorState(_))
    ));
}

#[tokio::test]
async fn preload_waits_for_ready() {
    let source = ManualSource::default();
    let todos = Collection::new(
        CollectionConfig::new(key_field("id")).with_sync(Arc::new(source.clone())),
    )
    .unwrap();

    let loader = todos.clone();
    let task = tokio::spawn(async move { loader.preload().await });
    todos.wait_for_status(CollectionStatus::Loading).await.unwrap();

    seed(&source.writer(), &[json!({"id": 1})]);
    source.writer().mark_ready().unwrap();
    task.await.unwrap().unwrap();
    assert!(todos.is_ready());
}

// ============================================================================
// Optimistic state against sync
// ============================================================================

#[tokio::test]
async fn confirmed_insert_is_delivered_once() {
    let source = ManualSource::default();
    let backend = source.clone();
    let confirm = mutation_fn(move |params| {
        let writer = backend.writer();
        async move {
            writer.begin().ok();
            for m in params.transaction.mutations() {
                let value = m.modified.unwrap_or(Value::Null);
                writer.write(SyncMessage::insert(value)).ok();
            }
            writer.commit().ok();
            Ok(())
        }
    });
    let todos = Collection::new(
        CollectionConfig::new(key_field("id"))
            .with_id("todos")
            .with_sync(Arc::new(source.clone()))
            .on_insert(confirm)
            .start_sync(),
    )
    .unwrap();
    source.writer().mark_ready().unwrap();

    let (_sub, batches) = record(&todos);
    let tx = todos.insert(json!({"id": 1, "title": "a"})).unwrap();
    tx.is_persisted().await.unwrap();

    assert_eq!(tx.state(), TransactionState::Completed);
    assert!(!todos.is_optimistic(&Key::Int(1)));
    assert_eq!(todos.get(&Key::Int(1)), Some(json!({"id": 1, "title": "a"})));

    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0], vec![ChangeMessage::insert(Key::Int(1), json!({"id": 1, "title": "a"}))]);
}

#[tokio::test]
async fn optimistic_value_shadows_sync_until_rollback() {
    let source = ManualSource::default();
    let never = mutation_fn(|_| std::future::pending());
    let todos = Collection::new(
        CollectionConfig::new(key_field("id"))
            .with_sync(Arc::new(source.clone()))
            .on_update(never)
            .start_sync(),
    )
    .unwrap();
    let writer = source.writer();
    seed(&writer, &[json!({"id": 1, "n": 1})]);

    let tx = todos.update(1, |d| d["n"] = json!(10)).unwrap();
    assert_eq!(todos.get(&Key::Int(1)).unwrap()["n"], 10);

    writer.begin().unwrap();
    writer
        .write(SyncMessage::update(json!({"n": 2})).with_key(1))
        .unwrap();
    writer.commit().unwrap();
    assert_eq!(todos.get(&Key::Int(1)).unwrap()["n"], 10);

    tx.rollback().unwrap();
    assert_eq!(todos.get(&Key::Int(1)).unwrap()["n"], 2);
}
