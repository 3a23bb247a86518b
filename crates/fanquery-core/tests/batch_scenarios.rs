//! End-to-end batch scenarios
//!
//! Drives `QueryBatch` the way a binding layer would: run a pass, subscribe,
//! await updates, re-run with a changed descriptor list.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fanquery_core::{
    query_key, BatchConfig, FetchError, QueryBatch, QueryCache, QueryDescriptor, QueryError,
    QueryKey, QueryResult, QueryStatus, TransformError,
};
use serde_json::{json, Value};
use tokio::sync::Notify;

async fn settle(batch: &QueryBatch, done: impl Fn(&[QueryResult]) -> bool) -> Vec<QueryResult> {
    let mut updates = batch.updates();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let results = batch.results();
            if done(&results) {
                return results;
            }
            updates.changed().await.expect("batch dropped");
        }
    })
    .await
    .expect("batch did not settle in time")
}

fn returning(key: QueryKey, value: Value) -> QueryDescriptor {
    QueryDescriptor::fetching(key, move |_ctx| {
        let value = value.clone();
        async move { Ok::<_, FetchError>(value) }
    })
}

fn gated(key: QueryKey, gate: Arc<Notify>, value: Value) -> QueryDescriptor {
    QueryDescriptor::fetching(key, move |_ctx| {
        let gate = Arc::clone(&gate);
        let value = value.clone();
        async move {
            gate.notified().await;
            Ok::<_, FetchError>(value)
        }
    })
}

fn values(results: &[QueryResult]) -> Vec<Option<Value>> {
    results.iter().map(|r| r.value().cloned()).collect()
}

#[tokio::test]
async fn test_seeds_then_fetched_values() {
    let batch = QueryBatch::new(QueryCache::default(), BatchConfig::default());
    let descriptors = vec![
        returning(query_key!["a"], json!({"wow": true})).with_seed(json!({"wow": false})),
        returning(query_key!["b"], json!("x")).with_seed(json!("y")),
        returning(query_key!["c"], json!("z")),
    ];

    let _sub = batch.subscribe(|_| {});
    let before = batch.run(descriptors).unwrap();
    assert_eq!(
        values(&before),
        vec![Some(json!({"wow": false})), Some(json!("y")), None]
    );
    assert!(before.iter().all(QueryResult::is_pending));

    let after = settle(&batch, |r| r.iter().all(QueryResult::is_success)).await;
    assert_eq!(
        values(&after),
        vec![Some(json!({"wow": true})), Some(json!("x")), Some(json!("z"))]
    );
    assert!(after.iter().all(|r| !r.is_seeded));
}

#[tokio::test]
async fn test_skip_stays_paused() {
    let cache = QueryCache::default();
    let batch = QueryBatch::new(cache.clone(), BatchConfig::default());
    let _sub = batch.subscribe(|_| {});

    let results = batch
        .run(vec![QueryDescriptor::skipped(query_key!["s"])])
        .unwrap();
    assert_eq!(results[0].status, QueryStatus::Paused);
    assert!(results[0].value.is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    cache.set_data(&query_key!["s"], json!("network"));

    let later = batch.results();
    assert_eq!(later[0].status, QueryStatus::Paused);
    assert!(later[0].value.is_none());
    assert_eq!(cache.metrics().fetches_started.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_readded_key_starts_fresh_and_drops_late_result() {
    let cache = QueryCache::default();
    let batch = QueryBatch::new(cache.clone(), BatchConfig::default());
    let _sub = batch.subscribe(|_| {});
    let gate = Arc::new(Notify::new());

    batch
        .run(vec![
            gated(query_key!["k"], Arc::clone(&gate), json!("old")),
            returning(query_key!["other"], json!(1)),
        ])
        .unwrap();
    // Key removed while its fetch is still in flight.
    batch.run(vec![returning(query_key!["other"], json!(1))]).unwrap();
    assert!(!cache.contains(&query_key!["k"]));

    let fresh_gate = Arc::new(Notify::new());
    let results = batch
        .run(vec![
            returning(query_key!["other"], json!(1)),
            gated(query_key!["k"], Arc::clone(&fresh_gate), json!("new")),
        ])
        .unwrap();
    assert!(results[1].is_pending());
    assert!(results[1].value.is_none());

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(batch.results()[1].value.is_none());
    assert_eq!(
        cache.metrics().fetches_dropped.load(Ordering::Relaxed),
        1
    );

    fresh_gate.notify_one();
    let settled = settle(&batch, |r| r[1].is_success()).await;
    assert_eq!(settled[1].value(), Some(&json!("new")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_key_positions_agree_while_fetches_settle() {
    let batch = QueryBatch::new(QueryCache::default(), BatchConfig::default());
    let listener_mismatches = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let mismatches = Arc::clone(&listener_mismatches);
        batch.subscribe(move |results| {
            if results.iter().any(|r| r != &results[0]) {
                mismatches.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    let counter = Arc::new(AtomicU64::new(0));
    let shared = QueryDescriptor::fetching(query_key!["dup"], move |_ctx| {
        let counter = Arc::clone(&counter);
        async move {
            tokio::task::yield_now().await;
            Ok::<_, FetchError>(json!(counter.fetch_add(1, Ordering::Relaxed)))
        }
    });
    batch.run(vec![shared; 300]).unwrap();
    assert_eq!(batch.observer_count(), 1);

    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    let refetcher = {
        let batch = batch.clone();
        tokio::spawn(async move {
            while tokio::time::Instant::now() < deadline {
                batch.refetch_all();
                tokio::task::yield_now().await;
            }
        })
    };

    let mut samples = 0;
    let mut sampled_mismatches = 0;
    while tokio::time::Instant::now() < deadline {
        let results = batch.results();
        samples += 1;
        if results.iter().any(|r| r != &results[0]) {
            sampled_mismatches += 1;
        }
        tokio::task::yield_now().await;
    }
    refetcher.await.unwrap();
    batch.stop();

    assert!(samples > 0);
    assert_eq!(sampled_mismatches, 0);
    assert_eq!(listener_mismatches.load(Ordering::Relaxed), 0);
    assert!(batch.metrics().notifications_total.load(Ordering::Relaxed) > 0);
}

#[tokio::test]
async fn test_shared_key_results_are_identical() {
    let batch = QueryBatch::new(QueryCache::default(), BatchConfig::default());
    let _sub = batch.subscribe(|_| {});
    let gate = Arc::new(Notify::new());

    let first = batch
        .run(vec![
            gated(query_key!["dup"], Arc::clone(&gate), json!(7)),
            returning(query_key!["mid"], json!(0)),
            gated(query_key!["dup"], Arc::clone(&gate), json!(8)),
        ])
        .unwrap();
    assert_eq!(first[0].status, first[2].status);
    assert_eq!(first[0].is_fetching, first[2].is_fetching);

    gate.notify_one();
    let settled = settle(&batch, |r| r[0].is_success()).await;
    assert_eq!(settled[0].value(), Some(&json!(7)));
    assert_eq!(settled[0].value, settled[2].value);
    assert_eq!(settled[0].status, settled[2].status);
    assert_eq!(settled[0].error, settled[2].error);
}

#[tokio::test]
async fn test_failing_fetch_is_localized() {
    let batch = QueryBatch::new(QueryCache::default(), BatchConfig::default());
    let _sub = batch.subscribe(|_| {});
    batch
        .run(vec![
            returning(query_key!["ok", 1], json!(1)),
            QueryDescriptor::fetching(query_key!["bad"], |_ctx| async {
                Err::<Value, _>(FetchError::failed("503"))
            }),
            returning(query_key!["ok", 2], json!(2)),
        ])
        .unwrap();

    let results = settle(&batch, |r| r.iter().all(|x| !x.is_pending())).await;
    assert_eq!(results.len(), 3);
    assert!(results[0].is_success());
    assert!(results[2].is_success());
    assert!(results[1].is_error());
    assert_eq!(
        results[1].error,
        Some(QueryError::Fetch(FetchError::failed("503")))
    );
}

#[tokio::test]
async fn test_transform_shapes_seed_and_fetch_alike() {
    let batch = QueryBatch::new(QueryCache::default(), BatchConfig::default());
    let _sub = batch.subscribe(|_| {});
    let len = |v: &Value| {
        v.as_array()
            .map(|a| json!(a.len()))
            .ok_or_else(|| TransformError::new("not a list"))
    };

    let before = batch
        .run(vec![
            returning(query_key!["list"], json!([1, 2, 3]))
                .with_seed(json!([]))
                .with_transform(len),
            returning(query_key!["scalar"], json!("oops")).with_transform(len),
        ])
        .unwrap();
    assert_eq!(before[0].value(), Some(&json!(0)));

    let after = settle(&batch, |r| r[0].is_success() && !r[1].is_pending()).await;
    assert_eq!(after[0].value(), Some(&json!(3)));
    assert!(after[1].is_error());
    assert!(matches!(after[1].error, Some(QueryError::Transform(_))));
}

#[tokio::test]
async fn test_invalid_pass_leaves_batch_untouched() {
    let cache = QueryCache::default();
    let batch = QueryBatch::new(cache.clone(), BatchConfig::default());
    let _sub = batch.subscribe(|_| {});
    batch.run(vec![returning(query_key!["a"], json!(1))]).unwrap();
    let before = settle(&batch, |r| r[0].is_success()).await;

    let err = batch
        .run(vec![
            returning(query_key!["a"], json!(1)),
            returning(QueryKey::new(Vec::<Value>::new()), json!(2)),
        ])
        .unwrap_err();
    assert!(err.is_configuration());

    let err = batch
        .run(vec![
            returning(query_key!["b"], json!(1)),
            QueryDescriptor::skipped(query_key!["b"]),
        ])
        .unwrap_err();
    assert!(err.is_configuration());

    assert_eq!(batch.results(), before);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_two_batches_share_cache_entries() {
    let cache = QueryCache::default();
    let left = QueryBatch::new(cache.clone(), BatchConfig::default());
    let right = QueryBatch::new(cache.clone(), BatchConfig::default());
    let _left_sub = left.subscribe(|_| {});
    let right_sub = right.subscribe(|_| {});

    left.run(vec![returning(query_key!["shared"], json!("v"))]).unwrap();
    right.run(vec![returning(query_key!["shared"], json!("v"))]).unwrap();
    settle(&right, |r| r[0].is_success()).await;

    assert_eq!(cache.len(), 1);
    assert_eq!(
        cache.metrics().fetches_started.load(Ordering::Relaxed),
        1
    );

    drop(left);
    assert!(cache.contains(&query_key!["shared"]));
    drop(right_sub);
    drop(right);
    assert!(cache.is_empty());
}
