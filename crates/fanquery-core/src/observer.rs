//! Single-query observer over a shared cache entry.
//!
//! An observer holds one reference on its cache entry for as long as it is
//! alive, exposes the entry's state, and starts fetches according to its
//! configuration. Reconfiguring an observer keeps any in-flight fetch.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::{CacheEntry, QueryCache, QueryState};
use crate::descriptor::{FetchAction, QueryDescriptor};
use crate::key::QueryKey;
use crate::subscription::Subscription;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Active configuration of an observer.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Fetch action, or the skip marker.
    pub fetch: FetchAction,
    /// Automatic fetching toggle.
    pub enabled: bool,
}

impl ObserverConfig {
    /// Returns true when this configuration allows fetching.
    #[must_use]
    pub fn can_fetch(&self) -> bool {
        self.enabled && !self.fetch.is_skip()
    }
}

impl From<&QueryDescriptor> for ObserverConfig {
    fn from(descriptor: &QueryDescriptor) -> Self {
        Self {
            fetch: descriptor.fetch().clone(),
            enabled: descriptor.is_enabled(),
        }
    }
}

/// Observer of one cache entry.
pub struct QueryObserver {
    id: u64,
    cache: QueryCache,
    entry: Arc<CacheEntry>,
    config: RwLock<ObserverConfig>,
    subscribers: AtomicUsize,
    destroyed: AtomicBool,
}

impl QueryCache {
    /// Creates an observer for `key`, attaching it to the shared entry.
    #[must_use]
    pub fn create_observer(&self, key: &QueryKey, config: ObserverConfig) -> Arc<QueryObserver> {
        let entry = self.acquire(key);
        Arc::new(QueryObserver {
            id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            cache: self.clone(),
            entry,
            config: RwLock::new(config),
            subscribers: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        })
    }
}

impl QueryObserver {
    /// Process-unique observer id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Key of the observed entry.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        self.entry.key()
    }

    /// Generation of the observed entry.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.entry.generation()
    }

    /// Current state of the observed entry.
    #[must_use]
    pub fn current_state(&self) -> QueryState {
        self.entry.state()
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> ObserverConfig {
        self.config.read().clone()
    }

    /// Returns true while at least one subscription is active.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscribers.load(Ordering::Acquire) > 0
    }

    /// Returns true after [`destroy`](Self::destroy).
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Registers `on_change`, called with the new state after every change of
    /// the entry. The first subscription starts a fetch when the entry has no
    /// fresh data.
    pub fn subscribe<F>(self: &Arc<Self>, on_change: F) -> Subscription
    where
        F: Fn(&QueryState) + Send + Sync + 'static,
    {
        if self.is_destroyed() {
            return Subscription::detached();
        }
        let listener_id = self.entry.add_listener(Arc::new(on_change));
        let first = self.subscribers.fetch_add(1, Ordering::AcqRel) == 0;
        if first {
            self.fetch_if_needed();
        }

        let entry = Arc::clone(&self.entry);
        let observer = Arc::downgrade(self);
        Subscription::new(move || {
            entry.remove_listener(listener_id);
            if let Some(observer) = observer.upgrade() {
                observer.subscribers.fetch_sub(1, Ordering::AcqRel);
            }
        })
    }

    /// Replaces the configuration in place. An in-flight fetch is kept; when
    /// the observer becomes able to fetch while subscribed, a fetch starts if
    /// the entry needs one.
    pub fn update_config(&self, config: ObserverConfig) {
        let could_fetch = {
            let mut current = self.config.write();
            let could_fetch = current.can_fetch();
            *current = config;
            could_fetch
        };
        if !could_fetch && self.is_subscribed() {
            self.fetch_if_needed();
        }
    }

    /// Starts a fetch regardless of staleness, unless the configuration
    /// forbids fetching or one is already in flight.
    pub fn refetch(&self) {
        if self.is_destroyed() {
            return;
        }
        let config = self.config.read().clone();
        if !config.can_fetch() {
            return;
        }
        if let FetchAction::Fetch(fetch) = &config.fetch {
            self.cache.fetch(&self.entry, fetch);
        }
    }

    /// Detaches from the cache entry. Idempotent.
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.cache.release(&self.entry);
        }
    }

    fn fetch_if_needed(&self) {
        if self.is_destroyed() {
            return;
        }
        let config = self.config.read().clone();
        let FetchAction::Fetch(fetch) = &config.fetch else {
            return;
        };
        if !config.enabled {
            return;
        }
        let state = self.entry.state();
        if state.is_fetching || !state.is_stale(self.cache.config().stale_time()) {
            return;
        }
        self.cache.fetch(&self.entry, fetch);
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.id)
            .field("key", self.key())
            .field("generation", &self.generation())
            .field("subscribers", &self.subscribers.load(Ordering::Relaxed))
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}
