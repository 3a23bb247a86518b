//! Batch reconciliation and projection benchmarks
//!
//! Measures a steady-state pass (every key reused), a pass that shifts the
//! window by one key, and projecting results of a large batch.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fanquery_core::{BatchConfig, FetchError, QueryBatch, QueryCache, QueryDescriptor, QueryKey};
use serde_json::json;

fn descriptors(range: std::ops::Range<usize>) -> Vec<QueryDescriptor> {
    range
        .map(|i| {
            let key = QueryKey::new([json!("row"), json!(i)]);
            if i % 3 == 0 {
                QueryDescriptor::skipped(key).with_seed(json!({"id": i}))
            } else {
                QueryDescriptor::fetching(key, |_ctx| async { Ok::<_, FetchError>(json!(null)) })
                    .with_seed(json!([]))
                    .with_transform(|v| Ok(json!(v.as_array().map_or(0, Vec::len))))
            }
        })
        .collect()
}

fn batch_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_run");

    for size in [16usize, 128, 1024] {
        let batch = QueryBatch::new(QueryCache::default(), BatchConfig::default());
        let steady = descriptors(0..size);
        batch.run(steady.clone()).unwrap();

        group.bench_with_input(BenchmarkId::new("steady", size), &steady, |b, list| {
            b.iter(|| black_box(batch.run(list.clone()).unwrap()));
        });

        let shifted = [descriptors(0..size), descriptors(1..size + 1)];
        let mut flip = 0;
        group.bench_with_input(BenchmarkId::new("sliding", size), &shifted, |b, lists| {
            b.iter(|| {
                flip ^= 1;
                black_box(batch.run(lists[flip].clone()).unwrap())
            });
        });
    }

    group.finish();
}

fn batch_results(c: &mut Criterion) {
    let batch = QueryBatch::new(QueryCache::default(), BatchConfig::default());
    batch.run(descriptors(0..1024)).unwrap();

    c.bench_function("results_1024", |b| {
        b.iter(|| black_box(batch.results()));
    });
}

criterion_group!(benches, batch_run, batch_results);
criterion_main!(benches);
