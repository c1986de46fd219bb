//! Unit-of-work benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kvlayer_bench::{random_data, BenchEngine};
use kvlayer_core::{FnChange, WriteUnitOfWork};

/// Benchmark an empty begin/commit cycle.
fn bench_empty_unit(c: &mut Criterion) {
    let mut engine = BenchEngine::new(false);
    c.bench_function("empty_unit_of_work", |b| {
        b.iter(|| {
            let wuow = WriteUnitOfWork::new(&mut engine.opctx).unwrap();
            wuow.commit().unwrap();
        });
    });
}

/// Benchmark single-record insert units with varying payloads.
fn bench_insert_unit(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_unit_of_work");

    for size in [64, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut engine = BenchEngine::new(false);
            let data = random_data(size);
            b.iter(|| {
                let mut wuow = WriteUnitOfWork::new(&mut engine.opctx).unwrap();
                let id = engine.store.insert_record(&mut wuow, black_box(&data)).unwrap();
                wuow.commit().unwrap();
                black_box(id);
            });
        });
    }

    group.finish();
}

/// Benchmark nested units with registered changes that roll back.
fn bench_nested_rollback(c: &mut Criterion) {
    let mut group = c.benchmark_group("nested_rollback");

    for changes in [1usize, 16, 128].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(changes), changes, |b, &changes| {
            let mut engine = BenchEngine::new(false);
            b.iter(|| {
                let mut outer = WriteUnitOfWork::new(&mut engine.opctx).unwrap();
                let mut inner = WriteUnitOfWork::new(&mut outer).unwrap();
                for _ in 0..changes {
                    inner
                        .recovery_unit()
                        .register_change(Box::new(FnChange::new().on_rollback(|| {})));
                }
                drop(inner);
                drop(outer);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_empty_unit, bench_insert_unit, bench_nested_rollback);
criterion_main!(benches);
