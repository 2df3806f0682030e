//! The client: one explicitly constructed, explicitly passed handle to the
//! whole engine.
//!
//! A [`QueryClient`] owns a [`QueryCache`], a [`MutationCache`], and the
//! focus/online signal managers, and wires the signals to background
//! refetch. There is no implicit process-wide instance: callers construct
//! a client and thread it (or clones of it) through their code.
//!
//! # Example
//!
//! ```
//! use requery::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client = QueryClient::new();
//! client.set_query_data(&query_key!["todos"], vec!["write docs".to_string()]);
//!
//! let todos = client
//!     .get_query_data::<Vec<String>>(&query_key!["todos"])
//!     .expect("just written");
//! assert_eq!(todos.len(), 1);
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::{QueryCache, QueryFilter};
use crate::config::QueryOptions;
use crate::key::QueryKey;
use crate::mutation::{MutationCache, MutationFilter};
use crate::query::RefetchTrigger;
use crate::signals::{FocusManager, OnlineManager};
use crate::snapshot::DehydratedState;

struct ClientInner {
    cache: QueryCache,
    mutations: MutationCache,
    focus: FocusManager,
    online: OnlineManager,
    defaults: QueryOptions,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for watcher in self.watchers.lock().drain(..) {
            watcher.abort();
        }
    }
}

/// Handle to the query engine: caches, signals, and defaults.
///
/// Cloning is cheap and shares the underlying state; the signal watcher
/// tasks stop when the last clone drops.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    /// Creates a client with default [`QueryOptions`].
    ///
    /// Must be called within a tokio runtime so the focus/reconnect
    /// watchers (and query fetches later on) can be spawned.
    #[must_use]
    pub fn new() -> Self {
        Self::with_defaults(QueryOptions::default())
    }

    /// Creates a client whose caches fall back to `defaults`.
    #[must_use]
    pub fn with_defaults(defaults: QueryOptions) -> Self {
        let focus = FocusManager::new();
        let online = OnlineManager::new();
        let cache = QueryCache::with_parts(defaults.clone(), online.clone());
        let mutations =
            MutationCache::with_parts(online.clone(), MutationCache::DEFAULT_RETAIN_LIMIT);

        let client = Self {
            inner: Arc::new(ClientInner {
                cache,
                mutations,
                focus,
                online,
                defaults,
                watchers: Mutex::new(Vec::new()),
            }),
        };
        client.spawn_watchers();
        client
    }

    /// Wires focus and reconnect transitions to background refetch of
    /// eligible queries. Skipped silently outside a tokio runtime.
    fn spawn_watchers(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let mut watchers = self.inner.watchers.lock();
        for (rx, trigger) in [
            (self.inner.focus.subscribe(), RefetchTrigger::Focus),
            (self.inner.online.subscribe(), RefetchTrigger::Reconnect),
        ] {
            let cache = self.inner.cache.clone();
            watchers.push(handle.spawn(watch_signal(rx, cache, trigger)));
        }
    }

    /// The query cache.
    #[must_use]
    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    /// The mutation cache.
    #[must_use]
    pub fn mutations(&self) -> &MutationCache {
        &self.inner.mutations
    }

    /// The window-focus signal.
    #[must_use]
    pub fn focus_manager(&self) -> &FocusManager {
        &self.inner.focus
    }

    /// The connectivity signal.
    #[must_use]
    pub fn online_manager(&self) -> &OnlineManager {
        &self.inner.online
    }

    /// The default options this client was built with; a convenient
    /// starting point for per-observer options.
    #[must_use]
    pub fn default_options(&self) -> &QueryOptions {
        &self.inner.defaults
    }

    /// Marks matching queries stale and refetches the actively observed
    /// ones in the background. See [`QueryCache::invalidate_queries`].
    pub fn invalidate_queries(&self, filter: &QueryFilter) {
        self.inner.cache.invalidate_queries(filter);
    }

    /// Fetches matching queries regardless of staleness, awaiting
    /// completion. See [`QueryCache::refetch_queries`].
    pub async fn refetch_queries(&self, filter: &QueryFilter) {
        self.inner.cache.refetch_queries(filter).await;
    }

    /// Cancels in-flight fetches without removing the queries.
    pub fn cancel_queries(&self, filter: &QueryFilter) {
        self.inner.cache.cancel_queries(filter);
    }

    /// Cancels and removes matching queries immediately.
    pub fn remove_queries(&self, filter: &QueryFilter) {
        self.inner.cache.remove_queries(filter);
    }

    /// Reads a query's data without fetching.
    #[must_use]
    pub fn get_query_data<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<Arc<T>> {
        self.inner.cache.get_data(key)
    }

    /// Writes a query's data directly, notifying observers synchronously.
    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: &QueryKey, value: T) {
        self.inner.cache.set_data(key, value);
    }

    /// Transforms a query's data in place. See [`QueryCache::update_data`].
    pub fn update_query_data<T, F>(&self, key: &QueryKey, update: F) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Option<Arc<T>>) -> Option<T>,
    {
        self.inner.cache.update_data(key, update)
    }

    /// Number of matching queries with a fetch in flight.
    #[must_use]
    pub fn is_fetching(&self, filter: &QueryFilter) -> usize {
        self.inner.cache.is_fetching(filter)
    }

    /// Number of in-flight mutations matching `filter`.
    #[must_use]
    pub fn is_mutating(&self, filter: &MutationFilter) -> usize {
        self.inner.mutations.is_mutating(filter)
    }

    /// Exports a serializable snapshot of the query cache.
    #[must_use]
    pub fn dehydrate(&self) -> DehydratedState {
        self.inner.cache.dehydrate()
    }

    /// Seeds the query cache from a snapshot.
    pub fn hydrate(&self, snapshot: DehydratedState) {
        self.inner.cache.hydrate(snapshot);
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("queries", &self.inner.cache.len())
            .field("mutations", &self.inner.mutations)
            .finish()
    }
}

/// Reacts to `true` transitions of a signal by background-refetching every
/// eligible query.
async fn watch_signal(
    mut rx: broadcast::Receiver<bool>,
    cache: QueryCache,
    trigger: RefetchTrigger,
) {
    loop {
        match rx.recv().await {
            Ok(true) => cache.refetch_on_trigger(trigger),
            Ok(false) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
