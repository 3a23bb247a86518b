//! Fetch actions and their cancellation signal.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::FetchError;
use crate::key::QueryKey;

/// Future returned by a fetch action.
pub type FetchFuture = BoxFuture<'static, Result<Value, FetchError>>;

/// Type-erased fetch action shared by every descriptor built from it.
pub type FetchFn = Arc<dyn Fn(FetchContext) -> FetchFuture + Send + Sync>;

/// Wraps an async closure into a [`FetchFn`].
pub fn fetch_fn<F, Fut>(f: F) -> FetchFn
where
    F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Stop signal handed to a running fetch.
///
/// Raised when the cache entry that started the fetch is released. Transports
/// that cannot abort may ignore it; their late result is discarded anyway.
#[derive(Debug, Clone, Default)]
pub struct FetchSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl FetchSignal {
    /// Creates a signal that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once the signal was raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Raises the signal. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Resolves once the signal is raised.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Context passed to each fetch invocation.
#[derive(Debug, Clone)]
pub struct FetchContext {
    key: QueryKey,
    signal: FetchSignal,
}

impl FetchContext {
    pub(crate) fn new(key: QueryKey, signal: FetchSignal) -> Self {
        Self { key, signal }
    }

    /// Key of the query being fetched.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Cancellation signal of this fetch.
    #[must_use]
    pub fn signal(&self) -> &FetchSignal {
        &self.signal
    }
}
