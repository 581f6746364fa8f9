//! Performance benchmarks for stowage-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use stowage_engine::expression::{and, eq, field, gt, val};
use stowage_engine::{
    key_field, BTreeIndex, Collection, CollectionConfig, CompareOptions, Comparison,
    CurrentStateOptions, IndexOptions, IndexQuery, Key, OrderBy, SubscribeOptions, Transaction,
    TransactionConfig,
};

fn rows(n: i64) -> Vec<Value> {
    (0..n)
        .map(|i| json!({"id": i, "name": format!("User {}", i), "age": i % 90, "team": i % 7}))
        .collect()
}

fn collection(n: i64) -> Collection {
    Collection::new(CollectionConfig::local_only(key_field("id"), rows(n))).unwrap()
}

fn bench_collection_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection_operations");

    group.bench_function("get", |b| {
        let users = collection(1000);
        let mut i = 0i64;
        b.iter(|| {
            i = (i + 1) % 1000;
            users.get(black_box(&Key::Int(i)))
        })
    });

    group.bench_function("stage_update", |b| {
        let users = collection(1000);
        let tx = Transaction::new(TransactionConfig::default().manual());
        let mut i = 0i64;
        b.iter(|| {
            i = (i + 1) % 1000;
            tx.update(&users, i, |u| u["age"] = json!(i)).unwrap()
        })
    });

    for size in [100i64, 1000, 10000] {
        group.bench_with_input(BenchmarkId::new("sync_load", size), &size, |b, &size| {
            let data = rows(size);
            b.iter(|| {
                Collection::new(CollectionConfig::local_only(key_field("id"), black_box(data.clone())))
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");
    let filter = and(vec![eq(field("team"), val(3)), gt(field("age"), val(45))]);

    for size in [1000i64, 10000] {
        let users = collection(size);
        group.bench_with_input(BenchmarkId::new("where_scan", size), &size, |b, _| {
            b.iter(|| {
                users.current_state_as_changes(CurrentStateOptions {
                    where_expr: Some(black_box(filter.clone())),
                    ..Default::default()
                })
            })
        });

        let indexed = collection(size);
        indexed.create_index(field("team"), IndexOptions::default()).unwrap();
        indexed.create_index(field("age"), IndexOptions::default()).unwrap();
        group.bench_with_input(BenchmarkId::new("where_indexed", size), &size, |b, _| {
            b.iter(|| {
                indexed.current_state_as_changes(CurrentStateOptions {
                    where_expr: Some(black_box(filter.clone())),
                    optimized_only: true,
                    ..Default::default()
                })
            })
        });

        group.bench_with_input(BenchmarkId::new("top_10_by_age", size), &size, |b, _| {
            b.iter(|| {
                indexed.current_state_as_changes(CurrentStateOptions {
                    order_by: Some(OrderBy::desc(field("age"))),
                    limit: Some(black_box(10)),
                    ..Default::default()
                })
            })
        });
    }

    group.finish();
}

fn bench_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("index");
    let data = rows(10000);
    let keys: Vec<Key> = (0..10000).map(Key::Int).collect();

    group.bench_function("build_10000", |b| {
        b.iter(|| {
            let mut index = BTreeIndex::new("age", None, field("age"), CompareOptions::default());
            index.build(keys.iter().zip(black_box(&data)));
            index
        })
    });

    let mut index = BTreeIndex::new("age", None, field("age"), CompareOptions::default());
    index.build(keys.iter().zip(&data));

    group.bench_function("lookup_eq", |b| {
        b.iter(|| index.lookup(Comparison::Eq, black_box(&json!(42))))
    });

    group.bench_function("take_20_from", |b| {
        b.iter(|| index.take(20, Some(black_box(&json!(60))), None))
    });

    group.finish();
}

fn bench_subscriptions(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscriptions");

    group.bench_function("subscribe_with_initial_state_1000", |b| {
        let users = collection(1000);
        b.iter(|| {
            users
                .subscribe_changes(
                    |changes| {
                        black_box(changes.len());
                    },
                    SubscribeOptions::default().with_initial_state(),
                )
                .unwrap()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_collection_operations,
    bench_queries,
    bench_index,
    bench_subscriptions,
);
criterion_main!(benches);
