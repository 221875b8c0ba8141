//! Benchmarks for point operations, window queries and nearest-neighbour search.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use phtree_rs::{Euclidean, PhTree};
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

const DIMS: usize = 3;

fn generate_keys(n: usize, seed: u64) -> Vec<Vec<i64>> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..DIMS).map(|_| rng.gen_range(-1_000_000..1_000_000)).collect())
        .collect()
}

fn build(keys: &[Vec<i64>]) -> PhTree<u64> {
    let mut tree = PhTree::new(DIMS).unwrap();
    for (i, key) in keys.iter().enumerate() {
        tree.put(key, i as u64).unwrap();
    }
    tree
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [1_000, 10_000, 100_000].iter() {
        let keys = generate_keys(*size, 1);

        group.bench_with_input(BenchmarkId::new("HashMap", size), size, |b, _| {
            b.iter(|| {
                let mut map: HashMap<Vec<i64>, u64> = HashMap::new();
                for (i, key) in keys.iter().enumerate() {
                    map.insert(key.clone(), i as u64);
                }
                black_box(map)
            });
        });

        group.bench_with_input(BenchmarkId::new("PhTree", size), size, |b, _| {
            b.iter(|| black_box(build(&keys)));
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for size in [1_000, 10_000, 100_000].iter() {
        let keys = generate_keys(*size, 2);
        let tree = build(&keys);

        group.bench_with_input(BenchmarkId::new("PhTree", size), size, |b, _| {
            b.iter(|| {
                let mut sum = 0u64;
                for key in keys.iter() {
                    if let Some(v) = tree.get(key).unwrap() {
                        sum += v;
                    }
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

fn bench_window_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_query");
    let keys = generate_keys(100_000, 3);
    let tree = build(&keys);

    for extent in [1_000i64, 10_000, 100_000].iter() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(4);
        let corners: Vec<Vec<i64>> = (0..100)
            .map(|_| (0..DIMS).map(|_| rng.gen_range(-1_000_000..1_000_000)).collect())
            .collect();

        group.bench_with_input(BenchmarkId::new("PhTree", extent), extent, |b, &extent| {
            b.iter(|| {
                let mut hits = 0usize;
                for min in corners.iter() {
                    let max: Vec<i64> = min.iter().map(|&m| m + extent).collect();
                    hits += tree.query(min, &max).unwrap().count();
                }
                black_box(hits)
            });
        });
    }

    group.finish();
}

fn bench_knn(c: &mut Criterion) {
    let mut group = c.benchmark_group("knn");
    let keys = generate_keys(100_000, 5);
    let tree = build(&keys);
    let centers = generate_keys(100, 6);

    for k in [1usize, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("PhTree", k), k, |b, &k| {
            b.iter(|| {
                let mut total = 0.0;
                for center in centers.iter() {
                    total += tree
                        .nearest_neighbour(k, &Euclidean, center)
                        .unwrap()
                        .map(|n| n.dist)
                        .sum::<f64>();
                }
                black_box(total)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_lookup, bench_window_query, bench_knn);
criterion_main!(benches);
