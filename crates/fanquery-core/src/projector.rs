//! Result projection: observer state + descriptor → visible result.
//!
//! Rules, in order:
//! 1. Skipped descriptor: `Paused`, value is the seed or nothing, no error.
//! 2. No successful fetch yet and a seed is configured: the seed is shown.
//! 3. Otherwise the last fetched value is shown.
//! 4. A transform, when present, is applied to whatever value was selected.
//!    Its failure, or its panic, becomes this result's error and nothing
//!    else's.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cache::{QueryState, QueryStatus};
use crate::descriptor::{QueryDescriptor, TransformFn};
use crate::error::{QueryError, TransformError};
use crate::key::QueryKey;

/// Externally visible result of one descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Key of the descriptor.
    pub key: QueryKey,
    /// Selected value after the transform, if any.
    pub value: Option<Arc<Value>>,
    /// Lifecycle status.
    pub status: QueryStatus,
    /// A fetch is in flight underneath.
    pub is_fetching: bool,
    /// `value` comes from the seed, not from a fetch.
    pub is_seeded: bool,
    /// Fetch or transform error.
    pub error: Option<QueryError>,
}

impl QueryResult {
    /// Returns the value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_deref()
    }

    /// Deserializes the value into `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.value
            .as_deref()
            .map(|v| serde_json::from_value(v.clone()))
    }

    /// Status is `Pending`.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Status is `Success`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// Status is `Error`.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// Status is `Paused`.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.status == QueryStatus::Paused
    }
}

/// Projects `state` through `descriptor`.
#[must_use]
pub fn project(state: &QueryState, descriptor: &QueryDescriptor) -> QueryResult {
    let seed = descriptor.seed().map(crate::descriptor::Seed::resolve);

    let mut result = if descriptor.is_skipped() {
        QueryResult {
            key: descriptor.key().clone(),
            is_seeded: seed.is_some(),
            value: seed,
            status: QueryStatus::Paused,
            is_fetching: false,
            error: None,
        }
    } else if state.data.is_none() && seed.is_some() {
        let status = match state.status {
            QueryStatus::Error => QueryStatus::Error,
            _ => QueryStatus::Pending,
        };
        QueryResult {
            key: descriptor.key().clone(),
            value: seed,
            status,
            is_fetching: state.is_fetching,
            is_seeded: true,
            error: state.error.clone().map(QueryError::from),
        }
    } else {
        QueryResult {
            key: descriptor.key().clone(),
            value: state.data.clone(),
            status: state.status,
            is_fetching: state.is_fetching,
            is_seeded: false,
            error: state.error.clone().map(QueryError::from),
        }
    };

    if let (Some(transform), Some(value)) = (descriptor.transform(), result.value.clone()) {
        match apply_transform(transform, value.as_ref()) {
            Ok(out) => result.value = Some(Arc::new(out)),
            Err(err) => {
                tracing::debug!(key = %result.key, error = %err, "Transform failed");
                result.value = None;
                result.status = QueryStatus::Error;
                result.error = Some(QueryError::Transform(err));
            }
        }
    }

    result
}

/// Runs `transform`, turning a panic into a [`TransformError`].
fn apply_transform(transform: &TransformFn, value: &Value) -> Result<Value, TransformError> {
    panic::catch_unwind(AssertUnwindSafe(|| transform(value))).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Err(TransformError::new(format!("transform panicked: {message}")))
    })
}

/// Projects every descriptor against its aligned state.
pub(crate) fn project_all(
    states: &[QueryState],
    descriptors: &[QueryDescriptor],
) -> Vec<QueryResult> {
    states
        .iter()
        .zip(descriptors)
        .map(|(state, descriptor)| project(state, descriptor))
        .collect()
}

/// Returns true if the result carries a transform failure.
pub(crate) fn is_transform_error(result: &QueryResult) -> bool {
    matches!(result.error, Some(QueryError::Transform(_)))
}
