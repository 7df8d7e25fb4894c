//! # Read/Update Benchmark
//!
//! Measures what the double buffer trades:
//! 1. Uncontended read cost vs `RwLock` and `Mutex`
//! 2. Read cost while another thread keeps updating
//! 3. Update cost as the number of registered reader threads grows
//!
//! Target: reads stay flat as reader threads are added.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dualbuf_core::{DoublyBuffered, Modification, StoreConfig};
use parking_lot::{Mutex, RwLock};

fn server_list(len: usize) -> Vec<u64> {
    (0..len as u64).collect()
}

/// Benchmark a single uncontended read of each primitive
fn bench_uncontended_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended_read");

    let store = DoublyBuffered::new(server_list(64));
    let rwlock = RwLock::new(server_list(64));
    let mutex = Mutex::new(server_list(64));

    group.bench_function("doubly_buffered", |b| {
        b.iter(|| {
            let read = store.read().unwrap();
            black_box(read[black_box(7)]);
        });
    });

    group.bench_function("rwlock", |b| {
        b.iter(|| {
            let read = rwlock.read();
            black_box(read[black_box(7)]);
        });
    });

    group.bench_function("mutex", |b| {
        b.iter(|| {
            let read = mutex.lock();
            black_box(read[black_box(7)]);
        });
    });

    group.finish();
}

/// Benchmark reads while a background thread updates in a loop
fn bench_read_under_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_under_updates");

    let store = Arc::new(DoublyBuffered::new(server_list(64)));
    let stop = Arc::new(AtomicBool::new(false));

    let updater = {
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                store.modify(|list| list.rotate_left(1));
            }
        })
    };

    group.bench_function("doubly_buffered", |b| {
        b.iter(|| {
            let read = store.read().unwrap();
            black_box(read.len());
        });
    });

    stop.store(true, Ordering::Relaxed);
    let _ = updater.join();

    group.finish();
}

/// Benchmark one update with N parked reader threads registered
fn bench_update_vs_readers(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_vs_registered_readers");

    for readers in [0usize, 4, 16, 64] {
        let store = Arc::new(DoublyBuffered::with_config(
            server_list(64),
            StoreConfig::default().with_reader_capacity(readers + 1),
        ));
        let stop = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..readers)
            .map(|_| {
                let store = Arc::clone(&store);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    drop(store.read().unwrap());
                    while !stop.load(Ordering::Relaxed) {
                        thread::park_timeout(std::time::Duration::from_millis(1));
                    }
                })
            })
            .collect();

        while store.registered_readers() < readers {
            thread::yield_now();
        }

        group.bench_with_input(BenchmarkId::new("update", readers), &readers, |b, _| {
            b.iter(|| {
                let _ = store.update(|list| {
                    list[0] = list[0].wrapping_add(1);
                    Modification::Applied(())
                });
            });
        });

        stop.store(true, Ordering::Relaxed);
        for handle in handles {
            let _ = handle.join();
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_uncontended_read,
    bench_read_under_updates,
    bench_update_vs_readers,
);
criterion_main!(benches);
