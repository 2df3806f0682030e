//! The query cache: the single source of truth for query state.
//!
//! A [`QueryCache`] owns the mapping from canonical key hash to
//! [`Query`]; it is the only thing that creates or destroys queries.
//! Bulk operations (invalidate, refetch, cancel, remove) select queries
//! with a [`QueryFilter`].
//!
//! The cache requires an ambient tokio runtime: fetches, garbage
//! collection, and invalidation-triggered refetches run as spawned tasks.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::config::QueryOptions;
use crate::key::{QueryHash, QueryKey};
use crate::query::{FetchStatus, Query, RefetchTrigger};
use crate::signals::OnlineManager;
use crate::snapshot::{self, DehydratedState};

/// Selects queries for bulk operations.
///
/// An empty filter matches every query. Key, activity, and predicate
/// constraints combine with AND semantics.
///
/// # Example
///
/// ```
/// use requery::cache::QueryFilter;
/// use requery::query_key;
///
/// // All inactive queries under the "posts" prefix.
/// let filter = QueryFilter::prefix(query_key!["posts"]).inactive_only();
/// # let _ = filter;
/// ```
#[derive(Clone, Default)]
pub struct QueryFilter {
    key: Option<QueryKey>,
    exact: bool,
    active: Option<bool>,
    predicate: Option<Arc<dyn Fn(&Query) -> bool + Send + Sync>>,
}

impl QueryFilter {
    /// Matches every query.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches queries whose key starts with `key`.
    #[must_use]
    pub fn prefix(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Matches only the query stored under exactly `key`.
    #[must_use]
    pub fn exact(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            exact: true,
            ..Self::default()
        }
    }

    /// Restricts to queries with at least one observer.
    #[must_use]
    pub fn active_only(mut self) -> Self {
        self.active = Some(true);
        self
    }

    /// Restricts to queries with no observers.
    #[must_use]
    pub fn inactive_only(mut self) -> Self {
        self.active = Some(false);
        self
    }

    /// Adds a predicate over the full query record, ANDed with the other
    /// constraints.
    #[must_use]
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Query) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn matches(&self, query: &Query) -> bool {
        if let Some(key) = &self.key {
            let matched = if self.exact {
                query.key().matches_exact(key)
            } else {
                query.key().matches_prefix(key)
            };
            if !matched {
                return false;
            }
        }
        if let Some(active) = self.active {
            if query.is_active() != active {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(query) {
                return false;
            }
        }
        true
    }
}

impl From<QueryKey> for QueryFilter {
    /// A bare key filters by prefix, matching the common bulk-operation
    /// call style.
    fn from(key: QueryKey) -> Self {
        Self::prefix(key)
    }
}

impl fmt::Debug for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilter")
            .field("key", &self.key)
            .field("exact", &self.exact)
            .field("active", &self.active)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

pub(crate) struct CacheShared {
    queries: DashMap<QueryHash, Arc<Query>>,
    defaults: QueryOptions,
    online: OnlineManager,
}

impl CacheShared {
    /// Removes an unobserved query once its GC timer fires.
    pub(crate) fn evict(&self, hash: QueryHash) {
        if let Some((_, query)) = self.queries.remove(&hash) {
            query.shutdown();
        }
    }
}

/// Owns all [`Query`] instances, keyed by canonical hash.
///
/// Cloning is cheap and shares the underlying cache.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<CacheShared>,
}

impl QueryCache {
    /// Creates an empty cache with default options and its own
    /// connectivity signal.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(QueryOptions::default(), OnlineManager::new())
    }

    /// Creates an empty cache with the given default options and online
    /// signal. The defaults apply to queries the cache creates on its own,
    /// e.g. through [`set_data`](Self::set_data).
    #[must_use]
    pub fn with_parts(defaults: QueryOptions, online: OnlineManager) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                queries: DashMap::new(),
                defaults,
                online,
            }),
        }
    }

    /// Returns the query stored under `key`'s hash, creating and
    /// registering it if absent.
    pub fn get_or_create(&self, key: QueryKey, options: &QueryOptions) -> Arc<Query> {
        use dashmap::mapref::entry::Entry;

        let hash = key.hash_key();
        match self.shared.queries.entry(hash) {
            Entry::Occupied(entry) => {
                let query = entry.get().clone();
                query.set_codec_if_absent(options.codec.clone());
                query
            }
            Entry::Vacant(entry) => {
                let query = Query::new(
                    key,
                    options,
                    Arc::downgrade(&self.shared),
                    self.shared.online.clone(),
                );
                entry.insert(query.clone());
                // Unobserved from birth; collected unless someone attaches.
                query.schedule_gc();
                query
            }
        }
    }

    /// Returns the query stored under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &QueryKey) -> Option<Arc<Query>> {
        self.shared
            .queries
            .get(&key.hash_key())
            .map(|entry| entry.value().clone())
    }

    /// Number of queries currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.queries.len()
    }

    /// Returns `true` if no queries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.queries.is_empty()
    }

    /// A snapshot of every stored query.
    #[must_use]
    pub fn queries(&self) -> Vec<Arc<Query>> {
        self.shared
            .queries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn matching(&self, filter: &QueryFilter) -> Vec<Arc<Query>> {
        let mut queries = self.queries();
        queries.retain(|query| filter.matches(query));
        queries
    }

    /// Marks matching queries stale and refetches the actively observed
    /// ones in the background.
    ///
    /// Fire-and-forget: returns without waiting for the refetches. Await
    /// [`refetch_queries`](Self::refetch_queries) to observe completion
    /// instead.
    pub fn invalidate_queries(&self, filter: &QueryFilter) {
        for query in self.matching(filter) {
            debug!(key = %query.key(), "invalidating query");
            query.invalidate();
            if query.has_enabled_observer() {
                if let Some(refetch) = query.refetch_stored() {
                    tokio::spawn(async move {
                        let _ = refetch.await;
                    });
                }
            }
        }
    }

    /// Fetches matching queries regardless of staleness, awaiting every
    /// completion. Queries that were never fetched are skipped.
    pub async fn refetch_queries(&self, filter: &QueryFilter) {
        let refetches: Vec<_> = self
            .matching(filter)
            .into_iter()
            .filter_map(|query| query.refetch_stored())
            .collect();
        futures::future::join_all(refetches).await;
    }

    /// Cancels in-flight fetches of matching queries without removing them.
    pub fn cancel_queries(&self, filter: &QueryFilter) {
        for query in self.matching(filter) {
            query.cancel();
        }
    }

    /// Cancels and removes matching queries immediately, bypassing the
    /// garbage-collection delay.
    pub fn remove_queries(&self, filter: &QueryFilter) {
        for query in self.matching(filter) {
            debug!(key = %query.key(), "removing query");
            self.shared.queries.remove(&query.hash());
            query.shutdown();
        }
    }

    /// Number of matching queries with a fetch in flight (including paused
    /// ones).
    #[must_use]
    pub fn is_fetching(&self, filter: &QueryFilter) -> usize {
        self.matching(filter)
            .iter()
            .filter(|query| query.state().fetch_status != FetchStatus::Idle)
            .count()
    }

    /// Reads a query's data without fetching. `None` if the key is absent
    /// or holds a different type. Data retained across a failed refetch is
    /// still returned.
    #[must_use]
    pub fn get_data<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<Arc<T>> {
        let query = self.get(key)?;
        query.revive_hydrated(None);
        query.state().data?.downcast::<T>().ok()
    }

    /// Writes a query's data directly, creating the query if absent.
    ///
    /// Updates the data timestamp and synchronously notifies observers;
    /// used for optimistic updates and cross-query synchronization.
    pub fn set_data<T: Send + Sync + 'static>(&self, key: &QueryKey, value: T) {
        let query = self.get_or_create(key.clone(), &self.shared.defaults);
        query.set_data(Arc::new(value));
    }

    /// Transforms a query's data in place.
    ///
    /// The updater receives the current value (if any, and of type `T`) and
    /// returns the replacement; returning `None` leaves the cache
    /// untouched. Returns the value written.
    pub fn update_data<T, F>(&self, key: &QueryKey, update: F) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Option<Arc<T>>) -> Option<T>,
    {
        let next = Arc::new(update(self.get_data::<T>(key))?);
        let query = self.get_or_create(key.clone(), &self.shared.defaults);
        query.set_data(next.clone());
        Some(next)
    }

    /// Exports a serializable snapshot of the cache. See
    /// [`snapshot`](crate::snapshot).
    #[must_use]
    pub fn dehydrate(&self) -> DehydratedState {
        snapshot::dehydrate(self)
    }

    /// Seeds this cache from a snapshot. See [`snapshot`](crate::snapshot).
    pub fn hydrate(&self, state: DehydratedState) {
        snapshot::hydrate(self, state);
    }

    /// Background-refetches every query an enabled observer wants refreshed
    /// for `trigger`.
    pub(crate) fn refetch_on_trigger(&self, trigger: RefetchTrigger) {
        for query in self.queries() {
            if query.wants_refetch_on(trigger) {
                debug!(key = %query.key(), ?trigger, "signal-triggered refetch");
                if let Some(refetch) = query.refetch_stored() {
                    tokio::spawn(async move {
                        let _ = refetch.await;
                    });
                }
            }
        }
    }

    pub(crate) fn online(&self) -> &OnlineManager {
        &self.shared.online
    }

    pub(crate) fn defaults(&self) -> &QueryOptions {
        &self.shared.defaults
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.len())
            .finish()
    }
}
