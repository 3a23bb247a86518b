//! Observer pool: one observer per distinct key, reconciled on every pass.
//!
//! The pool is keyed by canonical key hash, not by list position, so inserting
//! or removing descriptors mid-list never moves ownership of unrelated
//! observers. Occurrences of the same key within one list share an observer.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::cache::QueryCache;
use crate::descriptor::QueryDescriptor;
use crate::error::{Error, Result};
use crate::key::QueryKey;
use crate::observer::{ObserverConfig, QueryObserver};
use crate::subscription::Subscription;

/// Callback fired when any pooled observer changes.
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

struct PoolEntry {
    observer: Arc<QueryObserver>,
    subscription: Option<Subscription>,
}

impl PoolEntry {
    fn release(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        debug!(key = %self.observer.key(), observer = self.observer.id(), "Observer released");
        self.observer.destroy();
    }
}

/// Outcome of one reconciliation.
#[derive(Debug)]
pub struct Reconciled {
    /// Observers aligned with the input descriptors.
    pub observers: Vec<Arc<QueryObserver>>,
    /// Observers created in this pass.
    pub created: usize,
    /// Observers kept from the previous pass.
    pub reused: usize,
    /// Observers released in this pass.
    pub released: usize,
}

/// Pool of observers owned by one batch.
pub struct ObserverPool {
    cache: QueryCache,
    entries: HashMap<Arc<str>, PoolEntry>,
    max_queries: Option<usize>,
}

impl ObserverPool {
    /// Creates an empty pool over `cache`.
    #[must_use]
    pub fn new(cache: QueryCache, max_queries: Option<usize>) -> Self {
        Self {
            cache,
            entries: HashMap::new(),
            max_queries,
        }
    }

    /// Number of pooled observers (distinct keys).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the pool holds no observer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the pooled observer for `key`.
    #[must_use]
    pub fn get(&self, key: &QueryKey) -> Option<Arc<QueryObserver>> {
        self.entries
            .get(key.hash_str())
            .map(|e| Arc::clone(&e.observer))
    }

    /// Checks a descriptor list without touching the pool.
    pub fn validate(&self, descriptors: &[QueryDescriptor]) -> Result<()> {
        if let Some(max) = self.max_queries {
            if descriptors.len() > max {
                return Err(Error::TooManyQueries {
                    count: descriptors.len(),
                    max,
                });
            }
        }
        let mut skip_by_key: HashMap<&str, bool> = HashMap::with_capacity(descriptors.len());
        for (index, descriptor) in descriptors.iter().enumerate() {
            let key = descriptor.key();
            if key.is_empty() {
                return Err(Error::EmptyKey { index });
            }
            let skipped = descriptor.is_skipped();
            if let Some(&first) = skip_by_key.get(key.hash_str()) {
                if first != skipped {
                    return Err(Error::AmbiguousKey {
                        key: key.hash_str().to_string(),
                    });
                }
            } else {
                skip_by_key.insert(key.hash_str(), skipped);
            }
        }
        Ok(())
    }

    /// Aligns the pool with `descriptors`.
    ///
    /// On error the pool is left exactly as it was.
    pub fn reconcile(&mut self, descriptors: &[QueryDescriptor]) -> Result<Reconciled> {
        self.validate(descriptors)?;

        let mut previous = std::mem::take(&mut self.entries);
        let mut observers = Vec::with_capacity(descriptors.len());
        let mut created = 0;
        let mut reused = 0;

        for descriptor in descriptors {
            let hash = descriptor.key().hash_str();
            if let Some(entry) = self.entries.get(hash) {
                // Repeated key: shares the observer configured by its first occurrence.
                observers.push(Arc::clone(&entry.observer));
                continue;
            }
            let entry = match previous.remove(hash) {
                Some(entry) => {
                    entry.observer.update_config(ObserverConfig::from(descriptor));
                    reused += 1;
                    entry
                }
                None => {
                    let observer = self
                        .cache
                        .create_observer(descriptor.key(), ObserverConfig::from(descriptor));
                    debug!(key = %descriptor.key(), observer = observer.id(), "Observer created");
                    created += 1;
                    PoolEntry {
                        observer,
                        subscription: None,
                    }
                }
            };
            observers.push(Arc::clone(&entry.observer));
            self.entries.insert(Arc::from(hash), entry);
        }

        // Released last so keys that persist never lose their cache reference.
        let released = previous.len();
        for (_, entry) in previous {
            entry.release();
        }

        Ok(Reconciled {
            observers,
            created,
            reused,
            released,
        })
    }

    /// Subscribes every pooled observer that is not subscribed yet.
    pub fn subscribe_all(&mut self, listener: &ChangeListener) {
        for entry in self.entries.values_mut() {
            if entry.subscription.is_none() {
                let listener = Arc::clone(listener);
                entry.subscription = Some(entry.observer.subscribe(move |_| listener()));
            }
        }
    }

    /// Removes every observer subscription, keeping the observers pooled.
    pub fn unsubscribe_all(&mut self) {
        for entry in self.entries.values_mut() {
            if let Some(subscription) = entry.subscription.take() {
                subscription.unsubscribe();
            }
        }
    }

    /// Releases every pooled observer.
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.release();
        }
    }
}

impl Drop for ObserverPool {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for ObserverPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverPool")
            .field("observers", &self.entries.len())
            .field("max_queries", &self.max_queries)
            .finish_non_exhaustive()
    }
}
