//! Performance benchmarks for appends and snapshot fan-out.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use notesync::{MessageStore, StoreConfig, SubscriptionConfig, SyncEvent};
use tempfile::TempDir;

/// Append into stores of increasing size (each append copies the list).
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");

    for existing in [0usize, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("existing_messages", existing),
            &existing,
            |b, &existing| {
                let store = MessageStore::in_memory();
                for i in 0..existing {
                    store.append(&format!("note {}", i)).unwrap();
                }

                b.iter(|| {
                    black_box(store.append("benchmark note").unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Append with N subscribers draining their channels.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for subscribers in [1usize, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &subscribers| {
                let store = MessageStore::open(StoreConfig {
                    subscription: SubscriptionConfig { buffer_size: 4 },
                    ..Default::default()
                })
                .unwrap();
                let handles: Vec<_> = (0..subscribers).map(|_| store.subscribe()).collect();

                b.iter(|| {
                    store.append("fan out").unwrap();
                    for handle in &handles {
                        while let Ok(SyncEvent::Snapshot(s)) = handle.try_recv() {
                            black_box(s);
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

/// Durable appends, syncing every write vs every 100 writes.
fn bench_durable_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("durable_append");
    group.sample_size(20);

    for sync_interval in [1u64, 100] {
        group.bench_with_input(
            BenchmarkId::new("sync_interval", sync_interval),
            &sync_interval,
            |b, &sync_interval| {
                let dir = TempDir::new().unwrap();
                let store = MessageStore::open(StoreConfig {
                    data_path: Some(dir.path().join("store")),
                    sync_interval,
                    ..Default::default()
                })
                .unwrap();

                b.iter(|| {
                    black_box(store.append("durable note").unwrap());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_fanout, bench_durable_append);
criterion_main!(benches);
