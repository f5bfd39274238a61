//! Connector and coordinator benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::thread;
use txhandoff_bench::{fresh_context, random_worker_sequence};
use txhandoff_core::{
    TransactionConnector, TransactionCoordinator, TransactionDefinition, TransactionManager,
};

/// Benchmark opening and closing connectors.
fn bench_connector(c: &mut Criterion) {
    let mut group = c.benchmark_group("connector");

    // Nothing to lend
    group.bench_function("inert", |b| {
        let (_manager, ctx) = fresh_context();
        b.iter(|| {
            let connector = TransactionConnector::begin(black_box(&ctx)).unwrap();
            connector.close().unwrap();
        });
    });

    // Suspend on begin, resume on close
    group.bench_function("standalone", |b| {
        let (manager, ctx) = fresh_context();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        b.iter(|| {
            let connector = TransactionConnector::begin(black_box(&ctx)).unwrap();
            connector.close().unwrap();
        });
        manager.commit(status).unwrap();
    });

    // Linked to an open coordinator
    group.bench_function("linked", |b| {
        let (manager, ctx) = fresh_context();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();
        b.iter(|| {
            let connector = TransactionConnector::begin(black_box(&ctx)).unwrap();
            connector.close().unwrap();
        });
        coordinator.close().unwrap();
        manager.commit(status).unwrap();
    });

    group.finish();
}

/// Benchmark lending one transaction to several worker threads.
fn bench_lending(c: &mut Criterion) {
    let mut group = c.benchmark_group("lending");

    for workers in [1usize, 2, 4, 8] {
        group.throughput(Throughput::Elements(workers as u64));
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            let (manager, ctx) = fresh_context();
            let status = manager.begin(&TransactionDefinition::default()).unwrap();
            b.iter(|| {
                let connector = TransactionConnector::begin(&ctx).unwrap();
                thread::scope(|s| {
                    for _ in 0..workers {
                        s.spawn(|| {
                            let _child = connector.enter_child_thread().unwrap();
                        });
                    }
                });
                connector.close().unwrap();
            });
            manager.commit(status).unwrap();
        });
    }

    group.finish();
}

/// Benchmark the coordinator's same-thread resume arbitration.
fn bench_coordinator(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordinator");

    group.bench_function("unsuspended_context", |b| {
        let (manager, ctx) = fresh_context();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();
        b.iter(|| {
            let value = coordinator
                .do_in_unsuspended_context(|| Ok(black_box(1u32)))
                .unwrap();
            black_box(value);
        });
        coordinator.close().unwrap();
        manager.commit(status).unwrap();
    });

    group.bench_function("resume_arbitration", |b| {
        let (manager, ctx) = fresh_context();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();
        let connectors: Vec<_> = (0..4)
            .map(|_| TransactionConnector::begin(&ctx).unwrap())
            .collect();
        let sequence = random_worker_sequence(256, connectors.len());
        b.iter(|| {
            for &last in &sequence {
                coordinator.set_last_in_thread(Some(connectors[last].id()), true);
                for connector in &connectors {
                    black_box(coordinator.resume_in_child_thread(connector.id()).unwrap());
                }
                coordinator.suspend_if_needed().unwrap();
            }
        });
        for connector in &connectors {
            connector.close().unwrap();
        }
        coordinator.close().unwrap();
        manager.commit(status).unwrap();
    });

    group.finish();
}

criterion_group!(benches, bench_connector, bench_lending, bench_coordinator);
criterion_main!(benches);
