//! Query keys and their canonical hash.
//!
//! A key is an ordered list of JSON segments. Two keys are equal when their
//! canonical hashes are equal: object members are sorted recursively before
//! serialization, so `{"a":1,"b":2}` and `{"b":2,"a":1}` address the same
//! cache entry.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::{Map, Value};
use smallvec::SmallVec;

/// Segment storage, inline for the common short keys.
pub type KeySegments = SmallVec<[Value; 4]>;

/// Cache key of a query.
#[derive(Clone)]
pub struct QueryKey {
    segments: KeySegments,
    hash: Arc<str>,
}

impl QueryKey {
    /// Builds a key from segments.
    pub fn new<I, V>(segments: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let segments: KeySegments = segments.into_iter().map(Into::into).collect();
        let hash = hash_segments(&segments);
        Self {
            segments,
            hash: Arc::from(hash),
        }
    }

    /// Builds a key from a JSON array. A scalar becomes a single segment.
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Array(items) => Self::new(items),
            other => Self::new([other]),
        }
    }

    /// Returns the key segments.
    #[must_use]
    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    /// Returns true if the key has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Canonical hash used for cache lookup and equality.
    #[must_use]
    pub fn hash_str(&self) -> &str {
        &self.hash
    }

    /// Returns the segments as a JSON array.
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Array(self.segments.to_vec())
    }
}

/// Builds a [`QueryKey`] from a list of segments convertible to JSON.
///
/// ```rust
/// use fanquery_core::query_key;
///
/// let key = query_key!["todos", 7];
/// assert_eq!(key.hash_str(), r#"["todos",7]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),* $(,)?) => {
        $crate::QueryKey::new(::std::vec![$($crate::__private::Value::from($segment)),*])
    };
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueryKey").field(&&*self.hash).finish()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

impl From<&str> for QueryKey {
    fn from(segment: &str) -> Self {
        Self::new([segment])
    }
}

impl From<String> for QueryKey {
    fn from(segment: String) -> Self {
        Self::new([segment])
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(segments: Vec<Value>) -> Self {
        Self::new(segments)
    }
}

fn hash_segments(segments: &[Value]) -> String {
    let canonical = Value::Array(segments.iter().map(canonicalize).collect());
    // Serializing a Value cannot fail: keys are always strings.
    serde_json::to_string(&canonical).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
