//! Error types for fanquery.
//!
//! Only [`Error`] aborts a reconciliation pass. Fetch and transform failures
//! are values carried by the affected [`QueryResult`](crate::QueryResult) and
//! never escape the entry that produced them.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that abort a whole `run` pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A descriptor was built with a key that has no segments.
    #[error("Query at position {index} has an empty key")]
    EmptyKey {
        /// Position of the offending descriptor in the input list.
        index: usize,
    },

    /// The same key appears both as a real fetch and as a skip marker.
    #[error("Query key {key} is used by both a fetching and a skipped descriptor")]
    AmbiguousKey {
        /// Canonical hash of the conflicting key.
        key: String,
    },

    /// The batch exceeds the configured `batch.max_queries`.
    #[error("Batch has {count} queries, limit is {max}")]
    TooManyQueries {
        /// Number of descriptors supplied.
        count: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Returns true if this error was caused by a malformed descriptor list.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::EmptyKey { .. } | Self::AmbiguousKey { .. } | Self::TooManyQueries { .. }
        )
    }
}

/// Result type alias for fanquery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single fetch action.
///
/// Stored in the cache entry and cloned into every result that reads it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The fetch action reported a failure.
    #[error("Fetch failed: {0}")]
    Failed(String),

    /// The fetched payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The fetch was cancelled because its cache entry was released.
    #[error("Fetch cancelled")]
    Cancelled,

    /// No Tokio runtime was available to drive the fetch.
    #[error("Runtime unavailable: {0}")]
    Runtime(String),
}

impl FetchError {
    /// Creates a [`FetchError::Failed`] from anything displayable.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Failure raised by a descriptor's transform.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Transform error: {0}")]
pub struct TransformError(pub String);

impl TransformError {
    /// Creates a transform error from anything displayable.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

impl From<serde_json::Error> for TransformError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Error reported in a [`QueryResult`](crate::QueryResult).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The underlying observer's last fetch failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The descriptor's transform rejected the selected value.
    #[error(transparent)]
    Transform(#[from] TransformError),
}
