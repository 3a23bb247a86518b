//! # fanquery core
//!
//! Aggregates a variable-length list of asynchronous data queries into one
//! observable result list, backed by a shared, deduplicating query cache.
//!
//! ## Features
//!
//! - **Shared cache**: entries keyed by canonical JSON keys, one fetch per key in flight
//! - **Stable observers**: reconciled by key, never by list position
//! - **Seeds and transforms**: placeholder values and per-query projection
//! - **Skip marker**: queries present in the list but never fetched
//! - **Batched notifications**: one change notification per pass
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fanquery_core::{query_key, FetchError, QueryBatch, QueryCache, QueryDescriptor};
//! use fanquery_core::BatchConfig;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = QueryCache::default();
//!     let batch = QueryBatch::new(cache, BatchConfig::default());
//!
//!     let _subscription = batch.subscribe(|results| {
//!         println!("{} results changed", results.len());
//!     });
//!
//!     let results = batch.run(vec![
//!         QueryDescriptor::fetching(query_key!["user", 1], |_ctx| async {
//!             Ok::<_, FetchError>(json!({"name": "Ada"}))
//!         })
//!         .with_seed(json!({"name": "..."})),
//!         QueryDescriptor::skipped(query_key!["user", 2]),
//!     ])?;
//!     assert_eq!(results.len(), 2);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
// Clippy lints configured in workspace Cargo.toml [workspace.lints.clippy]
#![cfg_attr(
    test,
    allow(
        clippy::doc_markdown,
        clippy::uninlined_format_args,
        clippy::cast_lossless,
        clippy::manual_assert
    )
)]

pub mod cache;
#[cfg(test)]
mod cache_tests;
pub mod config;
#[cfg(test)]
mod config_tests;
pub mod coordinator;
pub mod descriptor;
pub mod error;
pub mod fetch;
pub mod key;
pub mod metrics;
pub mod observer;
pub mod pool;
pub mod projector;
pub mod subscription;

pub use cache::{CacheEntry, QueryCache, QueryState, QueryStatus};
pub use config::{BatchConfig, CacheConfig, ConfigError, FanqueryConfig, LogFormat, LoggingConfig};
pub use coordinator::{BatchListener, BatchPhase, QueryBatch};
pub use descriptor::{FetchAction, QueryDescriptor, Seed, TransformFn};
pub use error::{Error, FetchError, QueryError, Result, TransformError};
pub use fetch::{fetch_fn, FetchContext, FetchFn, FetchFuture, FetchSignal};
pub use key::QueryKey;
pub use metrics::{BatchMetrics, CacheMetrics, LatencyHistogram, SlowFetchLogger};
pub use observer::{ObserverConfig, QueryObserver};
pub use pool::{ObserverPool, Reconciled};
pub use projector::{project, QueryResult};
pub use subscription::Subscription;

#[doc(hidden)]
pub mod __private {
    pub use serde_json::Value;
}
