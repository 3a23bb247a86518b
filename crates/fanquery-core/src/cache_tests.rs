//! Tests for `cache` module
//!
//! Covers entry refcounting, fetch deduplication, and rejection of
//! results that settle after their entry was released.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use super::cache::*;
use crate::config::CacheConfig;
use crate::error::FetchError;
use crate::fetch::{fetch_fn, FetchFn};
use crate::key::QueryKey;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn gated_fetch(gate: Arc<Notify>, value: serde_json::Value) -> FetchFn {
    fetch_fn(move |_ctx| {
        let gate = Arc::clone(&gate);
        let value = value.clone();
        async move {
            gate.notified().await;
            Ok::<_, FetchError>(value)
        }
    })
}

#[test]
fn test_acquire_creates_single_entry_per_key() {
    let cache = QueryCache::default();
    let key = QueryKey::from("todos");

    let a = cache.acquire(&key);
    let b = cache.acquire(&key);

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.len(), 1);
    assert_eq!(a.observer_count(), 2);
    assert_eq!(cache.metrics().entries_created.load(Ordering::Relaxed), 1);
}

#[test]
fn test_release_last_reference_removes_entry_immediately() {
    let cache = QueryCache::default();
    let key = QueryKey::from("todos");

    let a = cache.acquire(&key);
    let b = cache.acquire(&key);
    cache.release(&a);
    assert!(cache.contains(&key));

    cache.release(&b);
    assert!(!cache.contains(&key));
    assert!(a.is_released());
    assert_eq!(cache.metrics().entries_removed.load(Ordering::Relaxed), 1);
}

#[test]
fn test_reacquire_after_removal_gets_new_generation() {
    let cache = QueryCache::default();
    let key = QueryKey::from("todos");

    let first = cache.acquire(&key);
    cache.release(&first);
    let second = cache.acquire(&key);

    assert_ne!(first.generation(), second.generation());
    assert_eq!(second.state(), QueryState::default());
}

#[test]
fn test_set_data_without_entry_returns_false() {
    let cache = QueryCache::default();
    assert!(!cache.set_data(&QueryKey::from("missing"), json!(1)));
}

#[test]
fn test_set_data_marks_success() {
    let cache = QueryCache::default();
    let key = QueryKey::from("todos");
    let _entry = cache.acquire(&key);

    assert!(cache.set_data(&key, json!([1, 2])));

    let state = cache.get_state(&key).unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data.as_deref(), Some(&json!([1, 2])));
    assert!(!state.is_stale(Duration::from_secs(60)));
}

#[test]
fn test_fetch_without_runtime_settles_with_runtime_error() {
    let cache = QueryCache::default();
    let key = QueryKey::from("todos");
    let entry = cache.acquire(&key);

    let fetch = fetch_fn(|_ctx| async { Ok::<_, FetchError>(json!(1)) });
    cache.fetch(&entry, &fetch);

    let state = entry.state();
    assert_eq!(state.status, QueryStatus::Error);
    assert!(matches!(state.error, Some(FetchError::Runtime(_))));
    assert!(!state.is_fetching);
}

#[tokio::test]
async fn test_fetch_success_updates_state_and_notifies() {
    let cache = QueryCache::default();
    let key = QueryKey::from("todos");
    let entry = cache.acquire(&key);
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    entry.add_listener(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let fetch = fetch_fn(|_ctx| async { Ok::<_, FetchError>(json!({"done": true})) });
    cache.fetch(&entry, &fetch);
    assert!(entry.state().is_fetching);

    wait_until(|| entry.state().status == QueryStatus::Success).await;
    let state = entry.state();
    assert_eq!(state.data.as_deref(), Some(&json!({"done": true})));
    assert!(!state.is_fetching);
    // is_fetching on, then settled.
    assert_eq!(notified.load(Ordering::SeqCst), 2);
    assert_eq!(cache.metrics().fetches_succeeded.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_fetch_failure_counts_consecutive_errors() {
    let cache = QueryCache::default();
    let key = QueryKey::from("flaky");
    let entry = cache.acquire(&key);
    let fetch = fetch_fn(|_ctx| async { Err::<serde_json::Value, _>(FetchError::failed("boom")) });

    cache.fetch(&entry, &fetch);
    wait_until(|| entry.state().failure_count == 1).await;
    cache.fetch(&entry, &fetch);
    wait_until(|| entry.state().failure_count == 2).await;

    let state = entry.state();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.error, Some(FetchError::failed("boom")));
    assert!(state.data.is_none());
}

#[tokio::test]
async fn test_concurrent_fetch_is_deduplicated() {
    let cache = QueryCache::default();
    let key = QueryKey::from("todos");
    let entry = cache.acquire(&key);
    let gate = Arc::new(Notify::new());
    let fetch = gated_fetch(Arc::clone(&gate), json!(1));

    cache.fetch(&entry, &fetch);
    cache.fetch(&entry, &fetch);

    let metrics = cache.metrics();
    assert_eq!(metrics.fetches_started.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.fetches_deduplicated.load(Ordering::Relaxed), 1);

    gate.notify_one();
    wait_until(|| entry.state().status == QueryStatus::Success).await;
}

#[tokio::test]
async fn test_late_result_after_release_is_dropped() {
    let cache = QueryCache::default();
    let key = QueryKey::from("todos");
    let old = cache.acquire(&key);
    let gate = Arc::new(Notify::new());
    cache.fetch(&old, &gated_fetch(Arc::clone(&gate), json!("stale")));

    cache.release(&old);
    let fresh = cache.acquire(&key);
    gate.notify_one();

    wait_until(|| cache.metrics().fetches_dropped.load(Ordering::Relaxed) == 1).await;
    assert_eq!(fresh.state(), QueryState::default());
    assert!(old.state().data.is_none());
}

#[tokio::test]
async fn test_release_cancels_inflight_signal() {
    let cache = QueryCache::default();
    let key = QueryKey::from("slow");
    let entry = cache.acquire(&key);
    let cancelled = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&cancelled);
    let fetch = fetch_fn(move |ctx| {
        let seen = Arc::clone(&seen);
        async move {
            ctx.signal().cancelled().await;
            seen.fetch_add(1, Ordering::SeqCst);
            Err::<serde_json::Value, _>(FetchError::Cancelled)
        }
    });

    cache.fetch(&entry, &fetch);
    tokio::task::yield_now().await;
    cache.release(&entry);

    wait_until(|| cancelled.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_gc_time_keeps_entry_until_expiry() {
    let cache = QueryCache::new(CacheConfig {
        gc_time_ms: 50,
        ..CacheConfig::default()
    });
    let key = QueryKey::from("todos");
    let entry = cache.acquire(&key);
    cache.release(&entry);

    assert!(cache.contains(&key));
    wait_until(|| !cache.contains(&key)).await;
    assert!(entry.is_released());
}

#[tokio::test]
async fn test_reacquire_within_gc_time_keeps_state() {
    let cache = QueryCache::new(CacheConfig {
        gc_time_ms: 30,
        ..CacheConfig::default()
    });
    let key = QueryKey::from("todos");
    let first = cache.acquire(&key);
    cache.set_data(&key, json!(42));
    cache.release(&first);

    let second = cache.acquire(&key);
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(Arc::ptr_eq(&first, &second));
    assert!(cache.contains(&key));
    assert_eq!(second.state().data.as_deref(), Some(&json!(42)));
}
