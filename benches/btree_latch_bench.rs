// B+tree latch-coupling performance benchmarks.
// Measures single-threaded insert/find throughput and multi-threaded
// upsert throughput under contention.

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use latchtree::Tree;

fn bench_upsert_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_upsert_sequential");

    for size in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let tree = Tree::with_max_keys(64);
                for i in 0..size {
                    tree.upsert(&format!("key-{i}"), &format!("value-{i}"));
                }
                black_box(&tree);
            });
        });
    }

    group.finish();
}

fn bench_find(c: &mut Criterion) {
    let tree = Tree::with_max_keys(64);
    for i in 0..10_000 {
        tree.upsert(&format!("key-{i}"), &format!("value-{i}"));
    }

    c.bench_function("btree_find", |b| {
        b.iter(|| {
            for i in (0..10_000).step_by(97) {
                black_box(tree.find(&format!("key-{i}")));
            }
        });
    });
}

fn bench_concurrent_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_concurrent_upsert");

    for thread_count in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(thread_count),
            &thread_count,
            |b, &thread_count| {
                b.iter(|| {
                    let tree = Arc::new(Tree::with_max_keys(64));
                    let per_thread = 2_000 / thread_count;
                    let handles: Vec<_> = (0..thread_count)
                        .map(|t| {
                            let tree = Arc::clone(&tree);
                            thread::spawn(move || {
                                for i in 0..per_thread {
                                    let key = format!("t{t}-key-{i}");
                                    tree.upsert(&key, "v");
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                    black_box(&tree);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_upsert_sequential,
    bench_find,
    bench_concurrent_upsert
);
criterion_main!(benches);
