//! Shared single-key query cache.
//!
//! The cache stores one [`CacheEntry`] per canonical key. Entries are
//! reference-counted by the observers attached to them: the last observer to
//! let go removes the entry (immediately, or after `cache.gc_time_ms`).
//!
//! Every entry carries a *generation* that is unique for the lifetime of the
//! cache. A fetch captures its entry, and settlement is rejected when that
//! entry was released or when a newer fetch superseded it, so a late response
//! can never leak into an entry created later for the same key.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::error::FetchError;
use crate::fetch::{FetchContext, FetchFn, FetchSignal};
use crate::key::QueryKey;
use crate::metrics::{CacheMetrics, SlowFetchLogger};

/// Lifecycle status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    /// Skipped: the query will not fetch.
    Paused,
    /// No successful fetch yet.
    #[default]
    Pending,
    /// The last fetch succeeded.
    Success,
    /// The last fetch failed.
    Error,
}

impl QueryStatus {
    /// Returns the lowercase name used in logs and CLI output.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a cache entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    /// Last successfully fetched value.
    pub data: Option<Arc<Value>>,
    /// Error of the last fetch, cleared by the next success.
    pub error: Option<FetchError>,
    /// Lifecycle status; never `Paused` at the cache level.
    pub status: QueryStatus,
    /// A fetch is in flight.
    pub is_fetching: bool,
    /// When `data` was last written.
    pub data_updated_at: Option<Instant>,
    /// When `error` was last written.
    pub error_updated_at: Option<Instant>,
    /// Consecutive failed fetches.
    pub failure_count: u32,
}

impl QueryState {
    /// Returns true if no data was stored yet or it is older than `stale_time`.
    #[must_use]
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        match self.data_updated_at {
            Some(at) => at.elapsed() >= stale_time,
            None => true,
        }
    }
}

pub(crate) type EntryListener = Arc<dyn Fn(&QueryState) + Send + Sync>;

struct InFlight {
    fetch_id: u64,
    signal: FetchSignal,
}

/// One cached query.
pub struct CacheEntry {
    key: QueryKey,
    generation: u64,
    state: RwLock<QueryState>,
    listeners: Mutex<Vec<(u64, EntryListener)>>,
    next_listener: AtomicU64,
    observers: AtomicUsize,
    released: AtomicBool,
    inflight: Mutex<Option<InFlight>>,
    next_fetch: AtomicU64,
}

impl CacheEntry {
    fn new(key: QueryKey, generation: u64) -> Self {
        Self {
            key,
            generation,
            state: RwLock::new(QueryState::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            observers: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            inflight: Mutex::new(None),
            next_fetch: AtomicU64::new(0),
        }
    }

    /// Key of this entry.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Generation of this entry, unique within its cache.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> QueryState {
        self.state.read().clone()
    }

    /// Number of observers holding this entry.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::Acquire)
    }

    /// Returns true once the entry was removed from its cache.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn add_listener(&self, listener: EntryListener) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));
        id
    }

    pub(crate) fn remove_listener(&self, id: u64) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn update(&self, f: impl FnOnce(&mut QueryState)) {
        let snapshot = {
            let mut state = self.state.write();
            f(&mut state);
            state.clone()
        };
        // Listeners run without any entry lock held.
        let listeners: Vec<EntryListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("observers", &self.observer_count())
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

pub(crate) struct CacheInner {
    entries: DashMap<Arc<str>, Arc<CacheEntry>>,
    next_generation: AtomicU64,
    pub(crate) config: CacheConfig,
    runtime: Option<Handle>,
    metrics: CacheMetrics,
    slow_fetch: SlowFetchLogger,
}

/// Shared query cache. Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct QueryCache {
    pub(crate) inner: Arc<CacheInner>,
}

impl QueryCache {
    /// Creates a cache. Fetches run on the Tokio runtime current at this call,
    /// or on the runtime current when each fetch starts.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, Handle::try_current().ok())
    }

    /// Creates a cache that spawns fetches on `runtime`.
    #[must_use]
    pub fn with_runtime(config: CacheConfig, runtime: Handle) -> Self {
        Self::build(config, Some(runtime))
    }

    fn build(config: CacheConfig, runtime: Option<Handle>) -> Self {
        let slow_fetch = SlowFetchLogger::new(config.slow_fetch_threshold());
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                next_generation: AtomicU64::new(1),
                config,
                runtime,
                metrics: CacheMetrics::new(),
                slow_fetch,
            }),
        }
    }

    /// Cache configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Cache metrics.
    #[must_use]
    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Returns true when no entry is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Returns true if an entry exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.entries.contains_key(key.hash_str())
    }

    /// Returns the live entry for `key`.
    #[must_use]
    pub fn entry(&self, key: &QueryKey) -> Option<Arc<CacheEntry>> {
        self.inner
            .entries
            .get(key.hash_str())
            .map(|e| Arc::clone(e.value()))
    }

    /// Returns the state of the live entry for `key`.
    #[must_use]
    pub fn get_state(&self, key: &QueryKey) -> Option<QueryState> {
        self.entry(key).map(|e| e.state())
    }

    /// Writes `value` into the live entry for `key` as if a fetch had
    /// succeeded, notifying its observers. Returns false when no entry exists.
    pub fn set_data(&self, key: &QueryKey, value: Value) -> bool {
        let Some(entry) = self.entry(key) else {
            return false;
        };
        let value = Arc::new(value);
        entry.update(|state| {
            state.data = Some(value);
            state.error = None;
            state.status = QueryStatus::Success;
            state.data_updated_at = Some(Instant::now());
            state.failure_count = 0;
        });
        true
    }

    /// Attaches one observer reference to the entry for `key`, creating it
    /// when absent.
    pub(crate) fn acquire(&self, key: &QueryKey) -> Arc<CacheEntry> {
        let inner = &self.inner;
        let entry = inner
            .entries
            .entry(Arc::from(key.hash_str()))
            .or_insert_with(|| {
                let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
                inner.metrics.entries_created.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, generation, "Cache entry created");
                Arc::new(CacheEntry::new(key.clone(), generation))
            });
        // Incremented under the shard lock so removal cannot race it.
        entry.observers.fetch_add(1, Ordering::AcqRel);
        Arc::clone(entry.value())
    }

    /// Drops one observer reference; the last one schedules removal.
    pub(crate) fn release(&self, entry: &Arc<CacheEntry>) {
        if entry.observers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let gc_time = self.inner.config.gc_time();
        let runtime = self.runtime();
        match runtime {
            Some(runtime) if !gc_time.is_zero() => {
                let cache = self.clone();
                let entry = Arc::clone(entry);
                runtime.spawn(async move {
                    tokio::time::sleep(gc_time).await;
                    cache.remove_if_unreferenced(&entry);
                });
            }
            _ => self.remove_if_unreferenced(entry),
        }
    }

    fn remove_if_unreferenced(&self, entry: &Arc<CacheEntry>) {
        let removed = self
            .inner
            .entries
            .remove_if(entry.key.hash_str(), |_, live| {
                Arc::ptr_eq(live, entry) && live.observers.load(Ordering::Acquire) == 0
            })
            .is_some();
        if !removed {
            return;
        }
        entry.released.store(true, Ordering::Release);
        if let Some(inflight) = entry.inflight.lock().take() {
            inflight.signal.cancel();
        }
        entry.listeners.lock().clear();
        self.inner
            .metrics
            .entries_removed
            .fetch_add(1, Ordering::Relaxed);
        debug!(key = %entry.key, generation = entry.generation, "Cache entry removed");
    }

    fn runtime(&self) -> Option<Handle> {
        self.inner
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
    }

    /// Starts `fetch` for `entry` unless one is already in flight.
    pub(crate) fn fetch(&self, entry: &Arc<CacheEntry>, fetch: &FetchFn) {
        if entry.is_released() {
            return;
        }
        let (fetch_id, signal) = {
            let mut slot = entry.inflight.lock();
            if slot.is_some() {
                self.inner
                    .metrics
                    .fetches_deduplicated
                    .fetch_add(1, Ordering::Relaxed);
                trace!(key = %entry.key, "Fetch already in flight");
                return;
            }
            let fetch_id = entry.next_fetch.fetch_add(1, Ordering::Relaxed);
            let signal = FetchSignal::new();
            *slot = Some(InFlight {
                fetch_id,
                signal: signal.clone(),
            });
            (fetch_id, signal)
        };

        self.inner
            .metrics
            .fetches_started
            .fetch_add(1, Ordering::Relaxed);
        entry.update(|state| state.is_fetching = true);

        let Some(runtime) = self.runtime() else {
            tracing::error!(key = %entry.key, "No Tokio runtime available to run fetch");
            self.settle(
                entry,
                fetch_id,
                Err(FetchError::Runtime("no Tokio runtime".to_string())),
                Duration::ZERO,
            );
            return;
        };

        let future = fetch(FetchContext::new(entry.key.clone(), signal));
        let cache = self.clone();
        let entry = Arc::clone(entry);
        runtime.spawn(async move {
            let started = Instant::now();
            let result = future.await;
            cache.settle(&entry, fetch_id, result, started.elapsed());
        });
    }

    fn settle(
        &self,
        entry: &Arc<CacheEntry>,
        fetch_id: u64,
        result: Result<Value, FetchError>,
        elapsed: Duration,
    ) {
        let current = {
            let mut slot = entry.inflight.lock();
            match slot.as_ref() {
                Some(inflight) if inflight.fetch_id == fetch_id => {
                    *slot = None;
                    true
                }
                _ => false,
            }
        };
        if !current || entry.is_released() {
            self.inner
                .metrics
                .fetches_dropped
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %entry.key,
                generation = entry.generation,
                fetch_id,
                "Dropping late fetch result"
            );
            return;
        }

        let succeeded = result.is_ok();
        self.inner.metrics.record_settled(elapsed, succeeded);
        self.inner
            .slow_fetch
            .log_if_slow(&entry.key, elapsed, !succeeded);

        let now = Instant::now();
        entry.update(|state| {
            state.is_fetching = false;
            match result {
                Ok(value) => {
                    state.data = Some(Arc::new(value));
                    state.error = None;
                    state.status = QueryStatus::Success;
                    state.data_updated_at = Some(now);
                    state.failure_count = 0;
                }
                Err(err) => {
                    debug!(key = %entry.key, error = %err, "Fetch failed");
                    state.error = Some(err);
                    state.status = QueryStatus::Error;
                    state.error_updated_at = Some(now);
                    state.failure_count = state.failure_count.saturating_add(1);
                }
            }
        });
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
