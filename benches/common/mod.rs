//! Scaffolding shared by the benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput};

/// Operations per iteration of the multi-threaded benchmarks.
pub const ITER: u64 = 32 * 1024;
/// Distinct keys the counter benchmarks spread their increments over.
pub const HOT_KEYS: u64 = 64;
/// Keys per iteration of the key distribution benchmarks.
pub const SIZE: usize = 1000;

/// Benchmarks `run` on rayon pools of 1 up to all logical CPUs.
///
/// `setup` runs once per pool size, outside of the measurement.
pub fn across_threads<T, S, R>(c: &mut Criterion, name: &str, mut setup: S, run: R)
where
    T: Sync,
    S: FnMut() -> T,
    R: Fn(&T) + Sync,
{
    let mut group = c.benchmark_group(name);
    group.throughput(Throughput::Elements(ITER));
    for threads in 1..=num_cpus::get() {
        let state = setup();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .expect("failed to build thread pool");
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, _| {
            pool.install(|| b.iter(|| run(&state)));
        });
    }
    group.finish();
}

/// Key sequences that stress different bits of the hash.
pub fn key_distributions() -> [(&'static str, Vec<usize>); 3] {
    // odd multiplier, so consecutive states do not repeat
    let scrambled = std::iter::successors(Some(0_usize), |s| {
        Some(s.wrapping_add(1).wrapping_mul(3_787_392_781))
    });
    [
        ("low", (0..SIZE).collect()),
        ("high", (0..SIZE).map(usize::swap_bytes).collect()),
        ("random", scrambled.skip(1).take(SIZE).collect()),
    ]
}
