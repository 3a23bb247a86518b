//! Query descriptors: the per-query configuration supplied on every pass.
//!
//! Descriptors are immutable and cheap to clone; the closures they carry are
//! shared behind `Arc`s. A descriptor either fetches ([`FetchAction::Fetch`])
//! or is skipped ([`FetchAction::Skip`]), never both.
//!
//! # Example
//!
//! ```rust
//! use fanquery_core::{query_key, FetchError, QueryDescriptor};
//! use serde_json::json;
//!
//! let todos = QueryDescriptor::fetching(query_key!["todos"], |_ctx| async {
//!     Ok::<_, FetchError>(json!([{"id": 1}]))
//! })
//! .with_seed(json!([]))
//! .with_transform(|v| Ok(json!(v.as_array().map_or(0, Vec::len))));
//!
//! let maybe_user = QueryDescriptor::skipped(query_key!["user", "me"]);
//! assert!(maybe_user.is_skipped());
//! assert!(!todos.is_skipped());
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::error::{FetchError, TransformError};
use crate::fetch::{fetch_fn, FetchContext, FetchFn};
use crate::key::QueryKey;

/// Transform applied to the selected value before it is exposed.
pub type TransformFn = Arc<dyn Fn(&Value) -> Result<Value, TransformError> + Send + Sync>;

/// Whether a descriptor fetches or is skipped.
#[derive(Clone)]
pub enum FetchAction {
    /// Run this action to populate the cache entry.
    Fetch(FetchFn),
    /// Do not fetch; the result stays paused.
    Skip,
}

impl FetchAction {
    /// Returns true for [`FetchAction::Skip`].
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }

    /// Returns the fetch action, if any.
    #[must_use]
    pub fn as_fetch(&self) -> Option<&FetchFn> {
        match self {
            Self::Fetch(f) => Some(f),
            Self::Skip => None,
        }
    }
}

impl fmt::Debug for FetchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(_) => f.write_str("Fetch(..)"),
            Self::Skip => f.write_str("Skip"),
        }
    }
}

/// Default value shown until the first successful fetch.
#[derive(Clone)]
pub enum Seed {
    /// Literal value.
    Value(Arc<Value>),
    /// Produced on first use, at most once per descriptor.
    Lazy(LazySeed),
}

/// Seed computed by a closure, memoized per descriptor.
#[derive(Clone)]
pub struct LazySeed {
    init: Arc<dyn Fn() -> Value + Send + Sync>,
    cell: Arc<OnceLock<Arc<Value>>>,
}

impl Seed {
    /// Resolves the seed, invoking a lazy initializer on first use.
    #[must_use]
    pub fn resolve(&self) -> Arc<Value> {
        match self {
            Self::Value(v) => Arc::clone(v),
            Self::Lazy(lazy) => Arc::clone(lazy.cell.get_or_init(|| Arc::new((lazy.init)()))),
        }
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Lazy(lazy) => match lazy.cell.get() {
                Some(v) => f.debug_tuple("Lazy").field(v).finish(),
                None => f.write_str("Lazy(<unresolved>)"),
            },
        }
    }
}

/// Configuration of one query in a batch.
#[derive(Clone)]
pub struct QueryDescriptor {
    key: QueryKey,
    fetch: FetchAction,
    seed: Option<Seed>,
    transform: Option<TransformFn>,
    enabled: bool,
}

impl QueryDescriptor {
    /// Creates a descriptor that fetches with `fetch`.
    #[must_use]
    pub fn new(key: impl Into<QueryKey>, fetch: FetchFn) -> Self {
        Self {
            key: key.into(),
            fetch: FetchAction::Fetch(fetch),
            seed: None,
            transform: None,
            enabled: true,
        }
    }

    /// Creates a descriptor from an async closure.
    pub fn fetching<F, Fut>(key: impl Into<QueryKey>, f: F) -> Self
    where
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        Self::new(key, fetch_fn(f))
    }

    /// Creates a skipped descriptor: it never fetches and reports `Paused`.
    #[must_use]
    pub fn skipped(key: impl Into<QueryKey>) -> Self {
        Self {
            key: key.into(),
            fetch: FetchAction::Skip,
            seed: None,
            transform: None,
            enabled: true,
        }
    }

    /// Creates a descriptor that fetches only when `condition` holds, and is
    /// skipped otherwise.
    #[must_use]
    pub fn fetch_if(key: impl Into<QueryKey>, condition: bool, fetch: FetchFn) -> Self {
        if condition {
            Self::new(key, fetch)
        } else {
            Self::skipped(key)
        }
    }

    /// Sets a literal seed.
    #[must_use]
    pub fn with_seed(mut self, seed: Value) -> Self {
        self.seed = Some(Seed::Value(Arc::new(seed)));
        self
    }

    /// Sets a seed produced by `init` on first use.
    #[must_use]
    pub fn with_seed_fn<F>(mut self, init: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.seed = Some(Seed::Lazy(LazySeed {
            init: Arc::new(init),
            cell: Arc::new(OnceLock::new()),
        }));
        self
    }

    /// Sets the transform applied to seeded and fetched values alike.
    #[must_use]
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Sets a shared transform.
    #[must_use]
    pub fn with_transform_fn(mut self, transform: TransformFn) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Enables or disables automatic fetching. A disabled descriptor stays
    /// pending instead of paused.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns the key.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Returns the fetch action.
    #[must_use]
    pub fn fetch(&self) -> &FetchAction {
        &self.fetch
    }

    /// Returns the seed, if any.
    #[must_use]
    pub fn seed(&self) -> Option<&Seed> {
        self.seed.as_ref()
    }

    /// Returns the transform, if any.
    #[must_use]
    pub fn transform(&self) -> Option<&TransformFn> {
        self.transform.as_ref()
    }

    /// Returns true if the descriptor carries the skip marker.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.fetch.is_skip()
    }

    /// Returns the `enabled` override.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl fmt::Debug for QueryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("key", &self.key)
            .field("fetch", &self.fetch)
            .field("seed", &self.seed)
            .field("transform", &self.transform.as_ref().map(|_| ".."))
            .field("enabled", &self.enabled)
            .finish()
    }
}
