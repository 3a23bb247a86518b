//! Batch plans: JSON files describing simulated queries.
//!
//! ```json
//! {
//!   "timeout_ms": 5000,
//!   "queries": [
//!     { "key": ["user", 1], "value": {"name": "Ada"}, "delay_ms": 40, "seed": {"name": "..."} },
//!     { "key": ["user", 1, "name"], "value": {"name": "Ada"}, "transform": "/name" },
//!     { "key": ["flaky"], "error": "503 Service Unavailable", "delay_ms": 10 },
//!     { "key": ["later"], "skip": true, "seed": 0 }
//!   ]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fanquery_core::{FetchError, QueryDescriptor, QueryKey, TransformError};
use serde::Deserialize;
use serde_json::Value;

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_enabled() -> bool {
    true
}

/// A whole plan.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    /// Upper bound for the batch to settle.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Queries, in result order.
    pub queries: Vec<PlannedQuery>,
}

/// One simulated query.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannedQuery {
    /// Key as a JSON array, or a scalar for a single-segment key.
    pub key: Value,
    /// Value the simulated fetch resolves with.
    #[serde(default)]
    pub value: Option<Value>,
    /// Failure message the simulated fetch rejects with.
    #[serde(default)]
    pub error: Option<String>,
    /// Simulated latency.
    #[serde(default)]
    pub delay_ms: u64,
    /// Seed shown until the fetch succeeds.
    #[serde(default)]
    pub seed: Option<Value>,
    /// Skip marker.
    #[serde(default)]
    pub skip: bool,
    /// JSON pointer applied to the selected value.
    #[serde(default)]
    pub transform: Option<String>,
    /// Automatic fetching toggle.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Plan {
    /// Reads and parses a plan file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Invalid plan {}", path.display()))
    }

    /// Parses a plan from JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(content)?;
        for (index, query) in plan.queries.iter().enumerate() {
            query
                .check()
                .with_context(|| format!("Query #{index} ({})", query.key))?;
        }
        Ok(plan)
    }

    /// Settle timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Builds one descriptor per planned query.
    #[must_use]
    pub fn descriptors(&self) -> Vec<QueryDescriptor> {
        self.queries.iter().map(PlannedQuery::descriptor).collect()
    }
}

impl PlannedQuery {
    fn check(&self) -> Result<()> {
        if self.value.is_some() && self.error.is_some() {
            bail!("`value` and `error` are mutually exclusive");
        }
        if self.skip && (self.value.is_some() || self.error.is_some()) {
            bail!("a skipped query cannot declare a fetch outcome");
        }
        if let Some(pointer) = &self.transform {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                bail!("transform `{pointer}` is not a JSON pointer");
            }
        }
        Ok(())
    }

    fn descriptor(&self) -> QueryDescriptor {
        let key = QueryKey::from_json(self.key.clone());
        let mut descriptor = if self.skip {
            QueryDescriptor::skipped(key)
        } else {
            let outcome = match &self.error {
                Some(message) => Err(FetchError::failed(message)),
                None => Ok(self.value.clone().unwrap_or(Value::Null)),
            };
            let delay = Duration::from_millis(self.delay_ms);
            QueryDescriptor::fetching(key, move |ctx| {
                let outcome = outcome.clone();
                async move {
                    tokio::select! {
                        () = ctx.signal().cancelled() => Err(FetchError::Cancelled),
                        () = tokio::time::sleep(delay) => outcome,
                    }
                }
            })
            .enabled(self.enabled)
        };
        if let Some(seed) = &self.seed {
            descriptor = descriptor.with_seed(seed.clone());
        }
        if let Some(pointer) = self.transform.clone() {
            descriptor = descriptor.with_transform(move |value| {
                value
                    .pointer(&pointer)
                    .cloned()
                    .ok_or_else(|| TransformError::new(format!("no value at `{pointer}`")))
            });
        }
        descriptor
    }
}
