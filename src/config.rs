//! Configuration for query behavior.
//!
//! [`QueryOptions`] controls how a query caches data, when it considers it
//! stale, and how failed fetches are retried. Options are supplied per
//! observer or as client-wide defaults.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::QueryError;
use crate::query::QueryData;
use crate::snapshot::DataCodec;

/// How many times a failed fetch is retried before giving up.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Retry up to this many times. `Count(0)` disables retrying.
    Count(u32),
    /// Retry while the predicate returns `true`; called with the number of
    /// failures so far (starting at 1) and the error of the latest attempt.
    Predicate(Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>),
}

impl RetryPolicy {
    /// Returns `true` if another attempt should be made after `failures`
    /// failed attempts.
    #[must_use]
    pub fn should_retry(&self, failures: u32, error: &QueryError) -> bool {
        match self {
            Self::Count(max) => failures <= *max,
            Self::Predicate(f) => f(failures, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Count(3)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count(n) => f.debug_tuple("Count").field(n).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// How long to wait between retry attempts.
#[derive(Clone)]
pub enum RetryDelay {
    /// Always wait the same duration, regardless of the attempt.
    Fixed(Duration),
    /// Exponential backoff: `min(base * 2^attempt_index, max)`.
    Backoff {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound on the delay.
        max: Duration,
    },
    /// Compute the delay from the zero-based attempt index and the error.
    Custom(Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>),
}

impl RetryDelay {
    /// The delay to wait before retry number `attempt_index` (zero-based).
    #[must_use]
    pub fn for_attempt(&self, attempt_index: u32, error: &QueryError) -> Duration {
        match self {
            Self::Fixed(d) => *d,
            Self::Backoff { base, max } => {
                let factor = 2u32.checked_pow(attempt_index.min(31)).unwrap_or(u32::MAX);
                base.checked_mul(factor).map_or(*max, |d| d.min(*max))
            }
            Self::Custom(f) => f(attempt_index, error),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Backoff { base, max } => f
                .debug_struct("Backoff")
                .field("base", base)
                .field("max", max)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// How long fetched data stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleTime {
    /// Data becomes stale once it is older than this duration.
    /// `After(Duration::ZERO)` means data is stale as soon as it lands.
    After(Duration),
    /// Data never becomes stale on its own; only invalidation marks it.
    Never,
}

impl Default for StaleTime {
    fn default() -> Self {
        Self::After(Duration::ZERO)
    }
}

impl From<Duration> for StaleTime {
    fn from(value: Duration) -> Self {
        Self::After(value)
    }
}

/// Retry configuration carried into a single fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchPolicy {
    /// Retry count or predicate.
    pub retry: RetryPolicy,
    /// Delay schedule between attempts.
    pub retry_delay: RetryDelay,
}

/// Per-query configuration.
///
/// All fields have defaults matching common stale-while-revalidate usage:
/// enabled, immediately stale, garbage-collected five minutes after the
/// last subscriber detaches, three retries with capped exponential backoff,
/// and background refetch on focus and reconnect.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use requery::config::QueryOptions;
///
/// let options = QueryOptions::new()
///     .with_stale_time(Duration::from_secs(30))
///     .with_cache_time(Duration::from_secs(300))
///     .with_retry_count(1);
/// ```
#[derive(Clone)]
pub struct QueryOptions {
    /// Whether the observer fetches at all. A disabled observer reports
    /// `Idle` and never triggers a fetch on its own.
    pub enabled: bool,
    /// Freshness window for cached data.
    pub stale_time: StaleTime,
    /// How long an unobserved query is retained before garbage collection.
    pub cache_time: Duration,
    /// Retry count or predicate for failed fetches.
    pub retry: RetryPolicy,
    /// Delay schedule between retry attempts.
    pub retry_delay: RetryDelay,
    /// Refetch stale data in the background when the window regains focus.
    pub refetch_on_focus: bool,
    /// Refetch stale data in the background when connectivity returns.
    pub refetch_on_reconnect: bool,
    /// Seed data persisted into the query when it is first created.
    pub initial_data: Option<QueryData>,
    /// Timestamp backdating `initial_data` for staleness purposes.
    pub initial_data_updated_at: Option<Instant>,
    /// Data shown while the first fetch is in flight; never persisted.
    pub placeholder_data: Option<QueryData>,
    /// Codec bridging this query's data to the snapshot boundary.
    pub codec: Option<Arc<DataCodec>>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_time: StaleTime::default(),
            cache_time: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
            retry_delay: RetryDelay::default(),
            refetch_on_focus: true,
            refetch_on_reconnect: true,
            initial_data: None,
            initial_data_updated_at: None,
            placeholder_data: None,
            codec: None,
        }
    }
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("refetch_on_focus", &self.refetch_on_focus)
            .field("refetch_on_reconnect", &self.refetch_on_reconnect)
            .field("initial_data", &self.initial_data.is_some())
            .field("placeholder_data", &self.placeholder_data.is_some())
            .field("codec", &self.codec.is_some())
            .finish()
    }
}

impl QueryOptions {
    /// Creates options with the defaults described above.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables fetching.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the freshness window.
    #[must_use]
    pub fn with_stale_time(mut self, stale_time: impl Into<StaleTime>) -> Self {
        self.stale_time = stale_time.into();
        self
    }

    /// Sets the garbage-collection delay for unobserved queries.
    #[must_use]
    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    /// Sets a fixed retry count.
    #[must_use]
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry = RetryPolicy::Count(count);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the delay schedule between retries.
    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Enables or disables background refetch on window focus.
    #[must_use]
    pub fn with_refetch_on_focus(mut self, refetch: bool) -> Self {
        self.refetch_on_focus = refetch;
        self
    }

    /// Enables or disables background refetch on reconnect.
    #[must_use]
    pub fn with_refetch_on_reconnect(mut self, refetch: bool) -> Self {
        self.refetch_on_reconnect = refetch;
        self
    }

    /// Seeds the query with initial data, persisted as a real cache entry.
    #[must_use]
    pub fn with_initial_data<T: Send + Sync + 'static>(mut self, data: T) -> Self {
        self.initial_data = Some(Arc::new(data));
        self
    }

    /// Backdates [`initial_data`](Self::initial_data) so staleness is
    /// computed from when the data was actually produced.
    #[must_use]
    pub fn with_initial_data_updated_at(mut self, at: Instant) -> Self {
        self.initial_data_updated_at = Some(at);
        self
    }

    /// Sets placeholder data shown while the first fetch is in flight.
    ///
    /// Placeholder data is reported as a successful result but never
    /// written into the cache.
    #[must_use]
    pub fn with_placeholder_data<T: Send + Sync + 'static>(mut self, data: T) -> Self {
        self.placeholder_data = Some(Arc::new(data));
        self
    }

    /// Attaches a snapshot codec so the query participates in
    /// [`dehydrate`](crate::cache::QueryCache::dehydrate) /
    /// [`hydrate`](crate::cache::QueryCache::hydrate).
    #[must_use]
    pub fn with_snapshot<T>(mut self) -> Self
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        self.codec = Some(DataCodec::of::<T>());
        self
    }

    /// The retry configuration carried into a fetch.
    #[must_use]
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = QueryOptions::default();
        assert!(options.enabled);
        assert_eq!(options.stale_time, StaleTime::After(Duration::ZERO));
        assert_eq!(options.cache_time, Duration::from_secs(5 * 60));
        assert!(options.refetch_on_focus);
        assert!(options.refetch_on_reconnect);
        assert!(options.initial_data.is_none());
        assert!(options.placeholder_data.is_none());
    }

    #[test]
    fn test_retry_count_policy() {
        let policy = RetryPolicy::Count(2);
        let err = QueryError::FetchFailed("x".to_string());
        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(2, &err));
        assert!(!policy.should_retry(3, &err));

        let never = RetryPolicy::Count(0);
        assert!(!never.should_retry(1, &err));
    }

    #[test]
    fn test_retry_predicate_policy() {
        let policy = RetryPolicy::Predicate(Arc::new(|failures, error| {
            failures < 5 && !error.is_cancelled()
        }));
        let err = QueryError::FetchFailed("x".to_string());
        assert!(policy.should_retry(4, &err));
        assert!(!policy.should_retry(5, &err));
    }

    #[test]
    fn test_backoff_delay() {
        let delay = RetryDelay::default();
        let err = QueryError::FetchFailed("x".to_string());
        assert_eq!(delay.for_attempt(0, &err), Duration::from_secs(1));
        assert_eq!(delay.for_attempt(1, &err), Duration::from_secs(2));
        assert_eq!(delay.for_attempt(2, &err), Duration::from_secs(4));
        // Capped at the maximum.
        assert_eq!(delay.for_attempt(10, &err), Duration::from_secs(30));
        assert_eq!(delay.for_attempt(31, &err), Duration::from_secs(30));
    }

    #[test]
    fn test_fixed_delay() {
        let delay = RetryDelay::Fixed(Duration::from_millis(100));
        let err = QueryError::FetchFailed("x".to_string());
        assert_eq!(delay.for_attempt(0, &err), Duration::from_millis(100));
        assert_eq!(delay.for_attempt(7, &err), Duration::from_millis(100));
    }

    #[test]
    fn test_custom_delay() {
        let delay = RetryDelay::Custom(Arc::new(|attempt, _| {
            Duration::from_millis(u64::from(attempt) * 10)
        }));
        let err = QueryError::FetchFailed("x".to_string());
        assert_eq!(delay.for_attempt(3, &err), Duration::from_millis(30));
    }

    #[test]
    fn test_builder_chain() {
        let options = QueryOptions::new()
            .with_enabled(false)
            .with_stale_time(StaleTime::Never)
            .with_retry_count(0)
            .with_refetch_on_focus(false);
        assert!(!options.enabled);
        assert_eq!(options.stale_time, StaleTime::Never);
        assert!(!options.refetch_on_focus);
    }
}
