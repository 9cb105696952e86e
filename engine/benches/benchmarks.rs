//! Performance benchmarks for pocket-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pocket_engine::{
    ChangeLog, FilterOperator, LamportTimestamp, LwwMap, Replica, SelectiveSync, SyncFilter,
    VectorClock,
};
use serde_json::json;

fn clock_with(nodes: usize, offset: u64) -> VectorClock {
    (0..nodes)
        .map(|i| (format!("node_{}", i), i as u64 + offset))
        .collect()
}

fn bench_vector_clock(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_clock");

    for size in [4, 32, 256] {
        let a = clock_with(size, 1);
        let b = clock_with(size, 2);

        group.bench_with_input(BenchmarkId::new("compare", size), &size, |bench, _| {
            bench.iter(|| black_box(&a).compare(black_box(&b)))
        });

        group.bench_with_input(BenchmarkId::new("merge", size), &size, |bench, _| {
            bench.iter(|| black_box(&a).merged(black_box(&b)))
        });
    }

    group.finish();
}

fn bench_lww_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("lww_merge");

    for size in [100, 1000] {
        let mut remote = LwwMap::new("remote");
        for i in 0..size {
            remote.set(format!("key_{}", i), i);
        }
        let state = remote.state().clone();

        group.bench_with_input(BenchmarkId::new("into_empty", size), &size, |bench, _| {
            bench.iter(|| {
                let mut local: LwwMap<usize> = LwwMap::new("local");
                local.merge(black_box(&state))
            })
        });

        group.bench_with_input(BenchmarkId::new("idempotent", size), &size, |bench, _| {
            let mut local: LwwMap<usize> = LwwMap::new("local");
            local.merge(&state);
            bench.iter(|| local.merge(black_box(&state)))
        });
    }

    group.bench_function("apply_remote_set", |b| {
        let mut map: LwwMap<u64> = LwwMap::new("local");
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            map.apply_remote_set("k", counter, LamportTimestamp::new(counter, "remote"))
        })
    });

    group.finish();
}

fn bench_replica(c: &mut Criterion) {
    let mut group = c.benchmark_group("replica");

    group.bench_function("local_insert", |b| {
        let mut replica = Replica::new("node1");
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            replica.insert("todos", &format!("t{}", id), json!({"title": "x"}), 1000)
        })
    });

    group.bench_function("apply_remote", |b| {
        let mut source = Replica::new("source");
        let changes: Vec<_> = (0..1000)
            .filter_map(|i| {
                source
                    .insert("todos", &format!("t{}", i), json!({"n": i}), 1000)
                    .ok()
            })
            .collect();

        b.iter(|| {
            let mut target = Replica::new("target");
            for change in &changes {
                target.apply_remote(black_box(change));
            }
            target
        })
    });

    group.finish();
}

fn bench_change_log(c: &mut Criterion) {
    let mut source = Replica::new("node1");
    let mut log = ChangeLog::new();
    for i in 0..10_000 {
        let collection = if i % 2 == 0 { "todos" } else { "notes" };
        if let Ok(change) = source.insert(collection, &format!("d{}", i), json!({}), 1000) {
            log.append(change);
        }
    }

    c.bench_function("change_log_page_filtered", |b| {
        b.iter(|| log.since_where(black_box(5_000), 100, |c| c.collection == "todos"))
    });
}

fn bench_selective_sync(c: &mut Criterion) {
    let sync = SelectiveSync::from_filters([
        SyncFilter::new("mine")
            .for_collection("todos")
            .rule("owner", FilterOperator::Eq, json!("alice")),
        SyncFilter::new("urgent")
            .for_collection("todos")
            .rule("priority", FilterOperator::Gte, json!(3)),
    ]);
    let doc = json!({"owner": "bob", "priority": 4, "tags": ["work"]});

    c.bench_function("selective_sync_evaluate", |b| {
        b.iter(|| sync.evaluate(black_box("todos"), black_box(&doc)))
    });
}

criterion_group!(
    benches,
    bench_vector_clock,
    bench_lww_merge,
    bench_replica,
    bench_change_log,
    bench_selective_sync,
);
criterion_main!(benches);
