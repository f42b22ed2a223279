use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};

use symbolic_x86::interval_map::{Interval, IntervalMap};

type Map = IntervalMap<u64, u32>;

/// A map of `n` single-page nodes with one-page gaps, so nothing merges.
fn page_map(n: u64) -> Map {
    let mut map = Map::new();
    for i in 0..n {
        map.insert(Interval::new(0x2000 * i, 0x2000 * i + 0xfff), i as u32);
    }
    map
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    for n in [64u64, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                Map::new,
                |mut map| {
                    for i in 0..n {
                        map.insert(Interval::new(0x2000 * i, 0x2000 * i + 0xfff), i as u32);
                    }
                    map
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_erase_splits(c: &mut Criterion) {
    let mut group = c.benchmark_group("erase_splits");
    for n in [64u64, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                || page_map(n),
                |mut map| {
                    // Punch a hole in the middle of every node
                    for i in 0..n {
                        let base = 0x2000 * i;
                        map.erase(Interval::new(base + 0x400, base + 0x7ff));
                    }
                    map
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let map = page_map(1024);
    c.bench_function("get", |b| {
        b.iter(|| {
            let mut hits = 0u32;
            for i in 0..1024u64 {
                if map.get(0x2000 * i + 0x800).is_some() {
                    hits += 1;
                }
            }
            hits
        });
    });

    c.bench_function("best_fit", |b| {
        b.iter(|| map.best_fit(0x1000, 0).map(|(interval, _)| *interval));
    });
}

criterion_group!(benches, bench_insert, bench_erase_splits, bench_lookup);
criterion_main!(benches);
