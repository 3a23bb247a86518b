//! Cache and batch metrics.
//!
//! Provides low-overhead, thread-safe counters for:
//! - Fetch lifecycle (started, succeeded, failed, deduplicated, dropped)
//! - Cache entry churn
//! - Reconciliation passes and pool churn
//! - Fetch latency histogram and slow fetch logging
//!
//! Counters use relaxed atomics; values are exported in Prometheus text format.

// Numeric casts in metrics are intentional: u128 -> u64 for durations is
// capped, and f64 averages are approximate.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::key::QueryKey;

/// Latency histogram buckets (milliseconds).
const BUCKET_BOUNDS_MS: [u64; 9] = [1, 5, 10, 50, 100, 500, 1000, 5000, 10000];

/// Fetch latency histogram with fixed buckets.
///
/// Buckets: <1ms, <5ms, <10ms, <50ms, <100ms, <500ms, <1s, <5s, <10s, ≥10s
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 10],
    sum_ns: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a new empty histogram.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a duration observation.
    pub fn observe(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.sum_ns.fetch_add(ns, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let bucket_idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| ms < bound)
            .unwrap_or(9);
        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total count of observations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns the sum of all durations in nanoseconds.
    #[must_use]
    pub fn sum_ns(&self) -> u64 {
        self.sum_ns.load(Ordering::Relaxed)
    }

    /// Returns the average duration in nanoseconds.
    #[must_use]
    pub fn avg_ns(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum_ns() as f64 / count as f64
        }
    }

    /// Returns bucket counts as an array.
    #[must_use]
    pub fn bucket_counts(&self) -> [u64; 10] {
        let mut counts = [0u64; 10];
        for (i, bucket) in self.buckets.iter().enumerate() {
            counts[i] = bucket.load(Ordering::Relaxed);
        }
        counts
    }
}

/// Logs fetches that exceed a threshold.
#[derive(Debug, Clone)]
pub struct SlowFetchLogger {
    threshold: Option<Duration>,
}

impl SlowFetchLogger {
    /// Creates a logger; `None` disables it.
    #[must_use]
    pub fn new(threshold: Option<Duration>) -> Self {
        Self { threshold }
    }

    /// Returns true if the duration reaches the threshold.
    #[must_use]
    pub fn is_slow(&self, duration: Duration) -> bool {
        self.threshold.is_some_and(|t| duration >= t)
    }

    /// Logs a slow fetch. Returns true if it was logged.
    pub fn log_if_slow(&self, key: &QueryKey, duration: Duration, failed: bool) -> bool {
        if !self.is_slow(duration) {
            return false;
        }
        tracing::warn!(
            key = %key,
            duration_ms = duration.as_millis() as u64,
            failed,
            "Slow fetch detected"
        );
        true
    }
}

/// Counters owned by a [`QueryCache`](crate::QueryCache).
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Fetches handed to the runtime
    pub fetches_started: AtomicU64,
    /// Fetches that settled with a value
    pub fetches_succeeded: AtomicU64,
    /// Fetches that settled with an error
    pub fetches_failed: AtomicU64,
    /// Fetch requests folded into an in-flight fetch
    pub fetches_deduplicated: AtomicU64,
    /// Late results discarded because their entry was released or superseded
    pub fetches_dropped: AtomicU64,
    /// Cache entries created
    pub entries_created: AtomicU64,
    /// Cache entries removed
    pub entries_removed: AtomicU64,
    /// Fetch latency
    pub fetch_latency: LatencyHistogram,
}

impl CacheMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a settled fetch.
    pub fn record_settled(&self, duration: Duration, succeeded: bool) {
        self.fetch_latency.observe(duration);
        if succeeded {
            self.fetches_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fetches_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Exports cache metrics in Prometheus format.
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let _ = writeln!(
            output,
            "# HELP fanquery_fetches_total Fetch lifecycle events"
        );
        let _ = writeln!(output, "# TYPE fanquery_fetches_total counter");
        for (outcome, counter) in [
            ("started", &self.fetches_started),
            ("succeeded", &self.fetches_succeeded),
            ("failed", &self.fetches_failed),
            ("deduplicated", &self.fetches_deduplicated),
            ("dropped", &self.fetches_dropped),
        ] {
            let _ = writeln!(
                output,
                "fanquery_fetches_total{{outcome=\"{outcome}\"}} {}",
                counter.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(output);

        let _ = writeln!(
            output,
            "# HELP fanquery_cache_entries_total Cache entry churn"
        );
        let _ = writeln!(output, "# TYPE fanquery_cache_entries_total counter");
        let _ = writeln!(
            output,
            "fanquery_cache_entries_total{{event=\"created\"}} {}",
            self.entries_created.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            output,
            "fanquery_cache_entries_total{{event=\"removed\"}} {}",
            self.entries_removed.load(Ordering::Relaxed)
        );
        let _ = writeln!(output);

        let _ = writeln!(
            output,
            "# HELP fanquery_fetch_duration_seconds Fetch latency"
        );
        let _ = writeln!(output, "# TYPE fanquery_fetch_duration_seconds histogram");
        let counts = self.fetch_latency.bucket_counts();
        let mut cumulative = 0u64;
        for (i, bound) in BUCKET_BOUNDS_MS.iter().enumerate() {
            cumulative += counts[i];
            let _ = writeln!(
                output,
                "fanquery_fetch_duration_seconds_bucket{{le=\"{}\"}} {cumulative}",
                *bound as f64 / 1000.0
            );
        }
        cumulative += counts[9];
        let _ = writeln!(
            output,
            "fanquery_fetch_duration_seconds_bucket{{le=\"+Inf\"}} {cumulative}"
        );
        let _ = writeln!(
            output,
            "fanquery_fetch_duration_seconds_sum {}",
            self.fetch_latency.sum_ns() as f64 / 1e9
        );
        let _ = writeln!(
            output,
            "fanquery_fetch_duration_seconds_count {}",
            self.fetch_latency.count()
        );

        output
    }
}

/// Counters owned by a [`QueryBatch`](crate::QueryBatch).
#[derive(Debug, Default)]
pub struct BatchMetrics {
    /// Completed reconciliation passes
    pub passes_total: AtomicU64,
    /// Passes aborted by a configuration error
    pub passes_failed: AtomicU64,
    /// Observers created by the pool
    pub observers_created: AtomicU64,
    /// Observers kept across passes
    pub observers_reused: AtomicU64,
    /// Observers released by the pool
    pub observers_released: AtomicU64,
    /// Batch notifications delivered to listeners
    pub notifications_total: AtomicU64,
    /// Transform failures, counted once when a position starts failing
    pub transform_errors: AtomicU64,
}

impl BatchMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the pool churn of one pass.
    pub fn record_pass(&self, created: u64, reused: u64, released: u64) {
        self.passes_total.fetch_add(1, Ordering::Relaxed);
        self.observers_created.fetch_add(created, Ordering::Relaxed);
        self.observers_reused.fetch_add(reused, Ordering::Relaxed);
        self.observers_released.fetch_add(released, Ordering::Relaxed);
    }

    /// Exports batch metrics in Prometheus format.
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let _ = writeln!(
            output,
            "# HELP fanquery_batch_passes_total Reconciliation passes"
        );
        let _ = writeln!(output, "# TYPE fanquery_batch_passes_total counter");
        let _ = writeln!(
            output,
            "fanquery_batch_passes_total{{outcome=\"ok\"}} {}",
            self.passes_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            output,
            "fanquery_batch_passes_total{{outcome=\"failed\"}} {}",
            self.passes_failed.load(Ordering::Relaxed)
        );
        let _ = writeln!(output);

        let _ = writeln!(
            output,
            "# HELP fanquery_pool_observers_total Observer pool churn"
        );
        let _ = writeln!(output, "# TYPE fanquery_pool_observers_total counter");
        for (event, counter) in [
            ("created", &self.observers_created),
            ("reused", &self.observers_reused),
            ("released", &self.observers_released),
        ] {
            let _ = writeln!(
                output,
                "fanquery_pool_observers_total{{event=\"{event}\"}} {}",
                counter.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(output);

        let _ = writeln!(
            output,
            "# HELP fanquery_batch_notifications_total Batch change notifications"
        );
        let _ = writeln!(output, "# TYPE fanquery_batch_notifications_total counter");
        let _ = writeln!(
            output,
            "fanquery_batch_notifications_total {}",
            self.notifications_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(output);

        let _ = writeln!(
            output,
            "# HELP fanquery_transform_errors_total Transform failures"
        );
        let _ = writeln!(output, "# TYPE fanquery_transform_errors_total counter");
        let _ = writeln!(
            output,
            "fanquery_transform_errors_total {}",
            self.transform_errors.load(Ordering::Relaxed)
        );

        output
    }
}
