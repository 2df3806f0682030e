//! Structured query keys and their canonical hashing.
//!
//! A [`QueryKey`] is an ordered sequence of segments: strings, integers,
//! booleans, or flat maps. Two keys identify the same cache entry iff their
//! canonical hashes are equal; sequence order is significant, map insertion
//! order is not.
//!
//! Keys are also the unit of filtering: a filter key is a *prefix* of the
//! stored keys it matches, so `query_key!["todos"]` matches both
//! `query_key!["todos"]` and `query_key!["todos", 5]`.
//!
//! # Example
//!
//! ```
//! use requery::query_key;
//! use requery::key::KeySegment;
//!
//! let all = query_key!["todos"];
//! let one = query_key!["todos", 5];
//! let preview = query_key!["todos", 5, KeySegment::map([("preview", true)])];
//!
//! assert!(one.matches_prefix(&all));
//! assert!(preview.matches_prefix(&all));
//! assert_ne!(one.hash_key(), preview.hash_key());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

/// One segment of a [`QueryKey`].
///
/// Map segments are stored in a `BTreeMap`, so their hash is independent of
/// the order entries were inserted in. The derived `Hash` includes the
/// variant, which keeps `Int(5)` and `Str("5")` distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeySegment {
    /// A string segment, e.g. `"todos"`.
    Str(String),
    /// An integer segment, e.g. a record id.
    Int(i64),
    /// A boolean segment.
    Bool(bool),
    /// A flat map segment, e.g. `{ preview: true }`.
    Map(BTreeMap<String, KeySegment>),
}

impl KeySegment {
    /// Builds a map segment from key/value pairs.
    ///
    /// # Example
    ///
    /// ```
    /// use requery::key::KeySegment;
    ///
    /// let a = KeySegment::map([("status", "done"), ("page", "1")]);
    /// let b = KeySegment::map([("page", "1"), ("status", "done")]);
    /// assert_eq!(a, b);
    /// ```
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<KeySegment>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Returns `true` if `filter` matches this segment.
    ///
    /// Non-map segments match by equality. A map filter matches by
    /// subset-equality: every entry of the filter map must be present with
    /// an equal value in this segment.
    fn matches(&self, filter: &KeySegment) -> bool {
        match (self, filter) {
            (Self::Map(stored), Self::Map(wanted)) => wanted
                .iter()
                .all(|(k, v)| stored.get(k).is_some_and(|s| s == v)),
            (stored, wanted) => stored == wanted,
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeySegment {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for KeySegment {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for KeySegment {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<BTreeMap<String, KeySegment>> for KeySegment {
    fn from(value: BTreeMap<String, KeySegment>) -> Self {
        Self::Map(value)
    }
}

/// The canonical hash of a [`QueryKey`], used for cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHash(u64);

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// An ordered, structured identifier for a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
    /// Creates a key from its segments.
    #[must_use]
    pub fn new(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }

    /// The key's segments, in order.
    #[must_use]
    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    /// Appends a segment, returning the extended key.
    #[must_use]
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }

    /// Computes the canonical hash of this key.
    ///
    /// Deterministic within a process: map segments hash in their canonical
    /// (sorted) entry order, sequence order and segment variants are
    /// significant.
    #[must_use]
    pub fn hash_key(&self) -> QueryHash {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        QueryHash(hasher.finish())
    }

    /// Returns `true` if `filter` is a prefix of this key.
    ///
    /// Each filter segment must match the stored segment at the same
    /// position; map segments match by subset-equality. An empty filter
    /// matches every key.
    #[must_use]
    pub fn matches_prefix(&self, filter: &QueryKey) -> bool {
        filter.0.len() <= self.0.len()
            && self
                .0
                .iter()
                .zip(filter.0.iter())
                .all(|(stored, wanted)| stored.matches(wanted))
    }

    /// Returns `true` if `filter` matches this key exactly.
    ///
    /// Like [`matches_prefix`](Self::matches_prefix), but the filter must
    /// also cover every segment of the stored key.
    #[must_use]
    pub fn matches_exact(&self, filter: &QueryKey) -> bool {
        filter.0.len() == self.0.len() && self.matches_prefix(filter)
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self(vec![KeySegment::from(value)])
    }
}

impl From<Vec<KeySegment>> for QueryKey {
    fn from(value: Vec<KeySegment>) -> Self {
        Self(value)
    }
}

impl FromIterator<KeySegment> for QueryKey {
    fn from_iter<I: IntoIterator<Item = KeySegment>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match segment {
                KeySegment::Str(s) => write!(f, "{s:?}")?,
                KeySegment::Int(n) => write!(f, "{n}")?,
                KeySegment::Bool(b) => write!(f, "{b}")?,
                KeySegment::Map(m) => {
                    write!(f, "{{")?;
                    for (j, (k, v)) in m.iter().enumerate() {
                        if j > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{k}: ")?;
                        match v {
                            KeySegment::Str(s) => write!(f, "{s:?}")?,
                            KeySegment::Int(n) => write!(f, "{n}")?,
                            KeySegment::Bool(b) => write!(f, "{b}")?,
                            KeySegment::Map(_) => write!(f, "{{..}}")?,
                        }
                    }
                    write!(f, "}}")?;
                }
            }
        }
        write!(f, "]")
    }
}

/// Builds a [`QueryKey`] from segment expressions.
///
/// # Example
///
/// ```
/// use requery::query_key;
/// use requery::key::KeySegment;
///
/// let key = query_key!["todos", 5, KeySegment::map([("preview", true)])];
/// assert_eq!(key.segments().len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::key::QueryKey::new(::std::vec::Vec::new())
    };
    ($($segment:expr),+ $(,)?) => {
        $crate::key::QueryKey::new(::std::vec![
            $($crate::key::KeySegment::from($segment)),+
        ])
    };
}
