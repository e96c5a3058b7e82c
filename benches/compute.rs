use compute_map::{ComputeOp, HashMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rayon::prelude::*;

mod common;
use common::{across_threads, key_distributions, HOT_KEYS, ITER, SIZE};

fn increment(old: Option<&u64>) -> ComputeOp<u64> {
    ComputeOp::Update(old.map_or(1, |v| v + 1))
}

fn filled() -> HashMap<u64, u64> {
    let map = HashMap::with_capacity(ITER as usize);
    (0..ITER)
        .into_par_iter()
        .for_each_init(|| map.guard(), |guard, i| {
            map.compute_v2(i, |_| ComputeOp::Update(i + 7), guard);
        });
    map
}

fn compute_insert(c: &mut Criterion) {
    across_threads(c, "compute_insert_u64_u64", || (), |_| {
        black_box(filled());
    });
}

fn compute_counter(c: &mut Criterion) {
    across_threads(
        c,
        "compute_counter_u64",
        || HashMap::<u64, u64>::with_capacity(HOT_KEYS as usize),
        |map| {
            (0..ITER)
                .into_par_iter()
                .for_each_init(|| map.guard(), |guard, i| {
                    map.compute_v2(i % HOT_KEYS, increment, guard);
                });
        },
    );
}

fn get_after_compute(c: &mut Criterion) {
    across_threads(c, "get_after_compute_u64_u64", filled, |map| {
        (0..ITER)
            .into_par_iter()
            .for_each_init(|| map.guard(), |guard, i| {
                assert_eq!(map.get(&i, guard), Some(&(i + 7)));
            });
    });
}

/// Single-threaded: insert, bump, then delete every other key, starting from an empty map so
/// that the table grows along the way.
fn compute_keydist(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_keydist");
    group.throughput(Throughput::Elements(SIZE as u64));

    for (name, keys) in key_distributions() {
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| {
                let map = HashMap::new();
                let guard = map.guard();
                for &k in &keys {
                    map.compute_v2(k, |_| ComputeOp::Update(k), &guard);
                }
                for &k in &keys {
                    map.compute_v2(k, |v| ComputeOp::Update(v.map_or(0, |v| v + 1)), &guard);
                }
                for &k in keys.iter().step_by(2) {
                    map.compute_v2(k, |_| ComputeOp::Delete, &guard);
                }
                black_box(map.len());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    compute_insert,
    compute_counter,
    get_after_compute,
    compute_keydist,
);
criterion_main!(benches);
