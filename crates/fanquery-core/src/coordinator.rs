//! Batch coordinator: a variable-length list of descriptors observed as one.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──first subscribe──► Subscribed ──last unsubscribe / stop──► Idle
//! ```
//!
//! Each call to [`QueryBatch::run`] is one pass: the descriptor list is
//! validated, the observer pool is reconciled against it, and the aligned
//! results are returned. Passes are serialized. Observer changes raised while
//! a pass is in progress are folded into a single notification after it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info_span, warn};

use crate::cache::{QueryCache, QueryState};
use crate::config::{BatchConfig, FanqueryConfig};
use crate::descriptor::QueryDescriptor;
use crate::error::Result;
use crate::key::QueryKey;
use crate::metrics::BatchMetrics;
use crate::observer::QueryObserver;
use crate::pool::{ChangeListener, ObserverPool};
use crate::projector::{is_transform_error, project_all, QueryResult};
use crate::subscription::Subscription;

/// Listener receiving the full result list after a change.
pub type BatchListener = Arc<dyn Fn(&[QueryResult]) + Send + Sync>;

/// Subscription phase of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchPhase {
    /// No listener; observers exist but never notify.
    Idle = 0,
    /// At least one listener; changes are delivered.
    Subscribed = 1,
}

impl BatchPhase {
    fn from_u8(value: u8) -> Self {
        if value == Self::Subscribed as u8 {
            Self::Subscribed
        } else {
            Self::Idle
        }
    }
}

#[derive(Default)]
struct Snapshot {
    descriptors: Vec<QueryDescriptor>,
    observers: Vec<Arc<QueryObserver>>,
}

struct BatchInner {
    cache: QueryCache,
    pass: Mutex<()>,
    pool: Mutex<ObserverPool>,
    snapshot: RwLock<Snapshot>,
    listeners: Mutex<Vec<(u64, BatchListener)>>,
    next_listener: AtomicU64,
    phase: AtomicU8,
    reconciling: AtomicBool,
    deferred: AtomicBool,
    version: watch::Sender<u64>,
    metrics: BatchMetrics,
    failing_transforms: Mutex<HashSet<(usize, QueryKey)>>,
}

impl BatchInner {
    fn phase(&self) -> BatchPhase {
        BatchPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn change_listener(self: &Arc<Self>) -> ChangeListener {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_observer_change();
            }
        })
    }

    fn on_observer_change(&self) {
        if self.reconciling.load(Ordering::Acquire) {
            self.deferred.store(true, Ordering::Release);
            return;
        }
        if self.phase() == BatchPhase::Subscribed {
            self.emit();
        }
    }

    /// Reads each distinct observer once so positions sharing a key see the
    /// same state.
    fn project_current(&self) -> Vec<QueryResult> {
        let (states, descriptors) = {
            let snapshot = self.snapshot.read();
            let mut by_observer: HashMap<u64, QueryState> =
                HashMap::with_capacity(snapshot.observers.len());
            let states: Vec<_> = snapshot
                .observers
                .iter()
                .map(|o| {
                    by_observer
                        .entry(o.id())
                        .or_insert_with(|| o.current_state())
                        .clone()
                })
                .collect();
            (states, snapshot.descriptors.clone())
        };
        project_all(&states, &descriptors)
    }

    /// Counts transform failures that were not failing at the previous
    /// notification.
    fn record_transform_failures(&self, results: &[QueryResult]) {
        let current: HashSet<(usize, QueryKey)> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| is_transform_error(r))
            .map(|(index, r)| (index, r.key.clone()))
            .collect();
        let mut failing = self.failing_transforms.lock();
        let new = current.difference(&failing).count();
        if new > 0 {
            self.metrics
                .transform_errors
                .fetch_add(new as u64, Ordering::Relaxed);
        }
        *failing = current;
    }

    fn emit(&self) {
        let results = self.project_current();
        self.record_transform_failures(&results);
        self.metrics
            .notifications_total
            .fetch_add(1, Ordering::Relaxed);
        self.version.send_modify(|v| *v += 1);

        let listeners: Vec<BatchListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&results);
        }
    }

    fn flush_deferred(&self) {
        if self.deferred.swap(false, Ordering::AcqRel) && self.phase() == BatchPhase::Subscribed {
            self.emit();
        }
    }

    fn start(self: &Arc<Self>) {
        {
            let _pass = self.pass.lock();
            self.phase
                .store(BatchPhase::Subscribed as u8, Ordering::Release);
            self.reconciling.store(true, Ordering::Release);
            self.pool.lock().subscribe_all(&self.change_listener());
            self.reconciling.store(false, Ordering::Release);
        }
        debug!("Batch subscribed");
        self.flush_deferred();
    }

    fn halt(&self) {
        let _pass = self.pass.lock();
        // A subscribe may have landed since the caller saw an empty list.
        if self.phase() == BatchPhase::Idle || !self.listeners.lock().is_empty() {
            return;
        }
        self.phase.store(BatchPhase::Idle as u8, Ordering::Release);
        self.pool.lock().unsubscribe_all();
        self.deferred.store(false, Ordering::Release);
        debug!("Batch idle");
    }

    fn remove_listener(&self, id: u64) {
        // Listener closures are dropped outside the lock.
        let (removed, now_empty) = {
            let mut listeners = self.listeners.lock();
            let removed = listeners
                .iter()
                .position(|(lid, _)| *lid == id)
                .map(|pos| listeners.remove(pos));
            (removed, listeners.is_empty())
        };
        if removed.is_some() && now_empty {
            self.halt();
        }
    }
}

/// Coordinates a list of query descriptors over a shared [`QueryCache`].
///
/// Cloning yields another handle to the same batch.
#[derive(Clone)]
pub struct QueryBatch {
    inner: Arc<BatchInner>,
}

impl QueryBatch {
    /// Creates an idle batch over `cache`.
    #[must_use]
    pub fn new(cache: QueryCache, config: BatchConfig) -> Self {
        let (version, _) = watch::channel(0);
        let pool = ObserverPool::new(cache.clone(), config.max_queries);
        Self {
            inner: Arc::new(BatchInner {
                cache,
                pass: Mutex::new(()),
                pool: Mutex::new(pool),
                snapshot: RwLock::new(Snapshot::default()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                phase: AtomicU8::new(BatchPhase::Idle as u8),
                reconciling: AtomicBool::new(false),
                deferred: AtomicBool::new(false),
                version,
                metrics: BatchMetrics::new(),
                failing_transforms: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Creates a batch with its own cache, both configured from `config`.
    #[must_use]
    pub fn from_config(config: &FanqueryConfig) -> Self {
        Self::new(QueryCache::new(config.cache.clone()), config.batch.clone())
    }

    /// Runs one pass over `descriptors` and returns the aligned results.
    ///
    /// Validation happens before anything is touched: on error the previous
    /// pass stays in effect.
    pub fn run(&self, descriptors: Vec<QueryDescriptor>) -> Result<Vec<QueryResult>> {
        let inner = &self.inner;
        let span = info_span!("batch_pass", queries = descriptors.len());
        let _enter = span.enter();

        {
            let _pass = inner.pass.lock();
            inner.reconciling.store(true, Ordering::Release);
            let outcome = {
                let mut pool = inner.pool.lock();
                pool.reconcile(&descriptors).map(|reconciled| {
                    *inner.snapshot.write() = Snapshot {
                        descriptors,
                        observers: reconciled.observers,
                    };
                    if inner.phase() == BatchPhase::Subscribed {
                        pool.subscribe_all(&inner.change_listener());
                    }
                    (reconciled.created, reconciled.reused, reconciled.released)
                })
            };
            inner.reconciling.store(false, Ordering::Release);

            match outcome {
                Ok((created, reused, released)) => {
                    inner
                        .metrics
                        .record_pass(created as u64, reused as u64, released as u64);
                    debug!(created, reused, released, "Pass reconciled");
                }
                Err(err) => {
                    inner.metrics.passes_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %err, "Pass rejected");
                    return Err(err);
                }
            }
        }

        let results = inner.project_current();
        inner.flush_deferred();
        Ok(results)
    }

    /// Registers `listener`. The first listener moves the batch to
    /// [`BatchPhase::Subscribed`]; dropping the last one moves it back.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&[QueryResult]) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut listeners = self.inner.listeners.lock();
            listeners.push((id, Arc::new(listener)));
            listeners.len() == 1
        };
        if first {
            self.inner.start();
        }
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_listener(id);
            }
        })
    }

    /// Drops every listener and returns to [`BatchPhase::Idle`]. Observers
    /// stay pooled.
    pub fn stop(&self) {
        let dropped = std::mem::take(&mut *self.inner.listeners.lock());
        self.inner.halt();
        drop(dropped);
    }

    /// Results of the current pass, projected from the latest states.
    #[must_use]
    pub fn results(&self) -> Vec<QueryResult> {
        self.inner.project_current()
    }

    /// Receiver bumped on every delivered notification.
    #[must_use]
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> BatchPhase {
        self.inner.phase()
    }

    /// Number of descriptors in the current pass.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.snapshot.read().descriptors.len()
    }

    /// Returns true if the current pass has no descriptor.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct observers currently pooled.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.pool.lock().len()
    }

    /// Observers of the current pass, aligned with its descriptors.
    #[must_use]
    pub fn observers(&self) -> Vec<Arc<QueryObserver>> {
        self.inner.snapshot.read().observers.clone()
    }

    /// Refetches every observer of the current pass that can fetch.
    pub fn refetch_all(&self) {
        let observers = self.observers();
        let mut seen = HashSet::new();
        for observer in observers {
            if seen.insert(observer.id()) {
                observer.refetch();
            }
        }
    }

    /// Shared cache.
    #[must_use]
    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    /// Batch metrics.
    #[must_use]
    pub fn metrics(&self) -> &BatchMetrics {
        &self.inner.metrics
    }
}

impl std::fmt::Debug for QueryBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBatch")
            .field("phase", &self.phase())
            .field("queries", &self.len())
            .field("listeners", &self.inner.listeners.lock().len())
            .finish_non_exhaustive()
    }
}
