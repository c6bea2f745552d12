//! Tree benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use disk_rtree::{Envelope, FileNodeStore, NullElementMapper, SearchPredicate, Tree, TreeOptions};
use std::hint::black_box;
use std::sync::Arc;
use tempfile::tempdir;

fn file_tree(path: &std::path::Path) -> Tree {
    let store = FileNodeStore::create(path, &TreeOptions::default()).unwrap();
    Tree::new(Box::new(store), Arc::new(NullElementMapper)).unwrap()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("Tree Insert");

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let path = dir.path().join("bench.rtree");
                    (file_tree(&path), dir)
                },
                |(tree, _dir)| {
                    for i in 0..size {
                        let x = (i % 100) as f64;
                        let y = (i / 100) as f64;
                        let env = Envelope::new(vec![x, y], vec![x + 1.0, y + 1.0]).unwrap();
                        tree.insert(&env, i as u64).unwrap();
                    }
                    black_box(tree.len().unwrap())
                },
            );
        });
    }

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("Tree Search");

    let dir = tempdir().unwrap();
    let path = dir.path().join("bench.rtree");
    let tree = file_tree(&path);

    for i in 0..10000u64 {
        let x = (i % 100) as f64;
        let y = (i / 100) as f64;
        let env = Envelope::new(vec![x, y], vec![x + 1.0, y + 1.0]).unwrap();
        tree.insert(&env, i).unwrap();
    }

    group.bench_function("search_10k", |b| {
        b.iter(|| {
            let query = Envelope::new(vec![25.0, 25.0], vec![75.0, 75.0]).unwrap();
            let hits: Vec<u64> = tree
                .search(&query, SearchPredicate::Intersects)
                .unwrap()
                .map(|r| r.unwrap())
                .collect();
            black_box(hits.len())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_insert, bench_search);
criterion_main!(benches);
