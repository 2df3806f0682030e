//! Typed subscriptions to query state.
//!
//! A [`QueryObserver`] binds one consumer's options (enabled flag,
//! staleness window, refetch triggers) to a [`Query`](crate::query::Query)
//! and derives the externally visible [`QueryObserverResult`]. When
//! subscribed:
//!
//! 1. If cached data exists, it is delivered immediately
//! 2. If data is missing or stale, a fetch is triggered, joining any fetch
//!    already in flight
//! 3. Every later state change re-derives the result, and the consumer is
//!    called only when the result actually changed
//!
//! Dependent queries need no engine support: an observer whose `enabled`
//! option depends on another observer's data is simply reconstructed by the
//! consumer when that data changes.
//!
//! # Example
//!
//! ```rust,ignore
//! use requery::prelude::*;
//!
//! let client = QueryClient::new();
//! let observer = QueryObserver::new(
//!     client.cache(),
//!     query_key!["user", 123],
//!     |_ctx| async { fetch_user(123).await },
//!     QueryOptions::new().with_stale_time(Duration::from_secs(30)),
//! );
//! observer.subscribe(|result| {
//!     if let Some(user) = result.data {
//!         render(&user);
//!     }
//! });
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{QueryCache, QueryFilter};
use crate::config::QueryOptions;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::query::{
    FetchContext, FetchFn, FetchStatus, ObserverEntry, Query, QueryData, QueryStatus,
};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

fn next_observer_id() -> u64 {
    NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed)
}

/// The derived result a [`QueryObserver`] hands to its consumer.
pub struct QueryObserverResult<T> {
    /// Result lifecycle of the underlying query, as seen by this observer.
    pub status: QueryStatus,
    /// Fetch activity of the underlying query.
    pub fetch_status: FetchStatus,
    /// Typed data, if present and of type `T`.
    pub data: Option<Arc<T>>,
    /// The last failure, if the latest fetch cycle failed.
    pub error: Option<QueryError>,
    /// Whether the data is stale under this observer's staleness window.
    pub is_stale: bool,
    /// Whether `data` is this observer's placeholder rather than cached
    /// data.
    pub is_placeholder: bool,
}

impl<T> QueryObserverResult<T> {
    /// Returns `true` if the first fetch is running and no data exists yet.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Loading)
    }

    /// Returns `true` if the query has produced data.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    /// Returns `true` if the latest fetch cycle failed.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    /// Returns `true` if no fetch was ever requested.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.status, QueryStatus::Idle)
    }

    /// Returns `true` if a fetch is in flight (including paused).
    #[must_use]
    pub const fn is_fetching(&self) -> bool {
        !matches!(self.fetch_status, FetchStatus::Idle)
    }

    /// Shallow comparison used to decide whether the consumer is
    /// re-notified: status, fetch status, data identity, error, staleness.
    fn same_as(&self, other: &Self) -> bool {
        self.status == other.status
            && self.fetch_status == other.fetch_status
            && self.error == other.error
            && self.is_stale == other.is_stale
            && self.is_placeholder == other.is_placeholder
            && match (&self.data, &other.data) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

impl<T> Clone for QueryObserverResult<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            fetch_status: self.fetch_status,
            data: self.data.clone(),
            error: self.error.clone(),
            is_stale: self.is_stale,
            is_placeholder: self.is_placeholder,
        }
    }
}

type OnChange<T> = Arc<dyn Fn(QueryObserverResult<T>) + Send + Sync>;

struct ObserverInner<T> {
    id: u64,
    cache: QueryCache,
    query: Arc<Query>,
    options: QueryOptions,
    fetch_fn: FetchFn,
    last: Mutex<Option<QueryObserverResult<T>>>,
    on_change: Mutex<Option<OnChange<T>>>,
    subscribed: AtomicBool,
}

impl<T: Send + Sync + 'static> ObserverInner<T> {
    /// Recomputes the derived result and notifies the consumer if it
    /// changed. Registered as this observer's notify hook on the query.
    fn on_query_update(&self) {
        let result = self.compute();
        let changed = {
            let mut last = self.last.lock();
            match last.as_ref() {
                Some(previous) if previous.same_as(&result) => false,
                _ => {
                    *last = Some(result.clone());
                    true
                }
            }
        };
        if changed {
            // Clone the hook out before invoking it: the consumer callback
            // may unsubscribe or resubscribe from inside.
            let on_change = self.on_change.lock().clone();
            if let Some(on_change) = on_change {
                on_change(result);
            }
        }
    }

    fn compute(&self) -> QueryObserverResult<T> {
        self.revive_hydrated();
        let state = self.query.state();

        let mut status = state.status;
        let mut data = state.data.and_then(|d| d.downcast::<T>().ok());
        let mut is_placeholder = false;

        // Placeholder data substitutes for the first fetch only; it is
        // never written into the query.
        if data.is_none() && status == QueryStatus::Loading {
            if let Some(placeholder) = self.typed_placeholder() {
                data = Some(placeholder);
                status = QueryStatus::Success;
                is_placeholder = true;
            }
        }

        QueryObserverResult {
            status,
            fetch_status: state.fetch_status,
            data,
            error: state.error,
            is_stale: self.query.is_stale(self.options.stale_time),
            is_placeholder,
        }
    }

    fn typed_placeholder(&self) -> Option<Arc<T>> {
        self.options
            .placeholder_data
            .clone()
            .and_then(|d| d.downcast::<T>().ok())
    }

    /// Decodes a raw snapshot payload into this observer's type, if the
    /// query still holds one and a codec is available.
    fn revive_hydrated(&self) {
        self.query.revive_hydrated(self.options.codec.clone());
    }

    fn should_fetch_on_subscribe(&self) -> bool {
        if !self.options.enabled {
            return false;
        }
        let state = self.query.state();
        state.data.is_none() || self.query.is_stale(self.options.stale_time)
    }

    fn trigger_fetch(&self) {
        let fetch = self
            .query
            .fetch(self.fetch_fn.clone(), self.options.fetch_policy());
        tokio::spawn(async move {
            let _ = fetch.await;
        });
    }

    fn detach(&self) {
        if self.subscribed.swap(false, Ordering::SeqCst) {
            self.query.detach_observer(self.id);
            *self.on_change.lock() = None;
        }
    }
}

/// A live subscription binding one consumer's options to a query.
///
/// Dropping the observer unsubscribes it; when the last observer of a
/// query detaches, the query's garbage-collection timer starts.
pub struct QueryObserver<T> {
    inner: Arc<ObserverInner<T>>,
}

impl<T: Send + Sync + 'static> QueryObserver<T> {
    /// Creates an observer for `key`, registering the query in the cache
    /// if it does not exist yet. No fetch happens until
    /// [`subscribe`](Self::subscribe) or [`refetch`](Self::refetch).
    pub fn new<K, F, Fut>(cache: &QueryCache, key: K, fetch: F, options: QueryOptions) -> Self
    where
        K: Into<QueryKey>,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let query = cache.get_or_create(key.into(), &options);
        let fetch_fn: FetchFn = Arc::new(move |ctx| {
            let attempt = fetch(ctx);
            Box::pin(async move { attempt.await.map(|value| Arc::new(value) as QueryData) })
        });

        Self {
            inner: Arc::new(ObserverInner {
                id: next_observer_id(),
                cache: cache.clone(),
                query,
                options,
                fetch_fn,
                last: Mutex::new(None),
                on_change: Mutex::new(None),
                subscribed: AtomicBool::new(false),
            }),
        }
    }

    /// Attaches to the query and starts receiving results.
    ///
    /// The current result is delivered immediately. If the observer is
    /// enabled and the query has no data, is stale, or was invalidated, a
    /// fetch is triggered, joining any fetch already in flight.
    pub fn subscribe<F>(&self, on_change: F)
    where
        F: Fn(QueryObserverResult<T>) + Send + Sync + 'static,
    {
        // Subscribing again replaces the previous registration.
        self.inner.detach();
        *self.inner.on_change.lock() = Some(Arc::new(on_change));
        self.inner.revive_hydrated();

        let notify: Arc<dyn Fn() + Send + Sync> = {
            let weak = Arc::downgrade(&self.inner);
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_query_update();
                }
            })
        };
        self.inner.query.attach_observer(
            ObserverEntry {
                id: self.inner.id,
                enabled: self.inner.options.enabled,
                stale_time: self.inner.options.stale_time,
                refetch_on_focus: self.inner.options.refetch_on_focus,
                refetch_on_reconnect: self.inner.options.refetch_on_reconnect,
                policy: self.inner.options.fetch_policy(),
                notify,
            },
            self.inner.options.cache_time,
        );
        self.inner.subscribed.store(true, Ordering::SeqCst);

        let result = self.inner.compute();
        *self.inner.last.lock() = Some(result.clone());
        let on_change = self.inner.on_change.lock().clone();
        if let Some(on_change) = on_change {
            on_change(result);
        }

        if self.inner.should_fetch_on_subscribe() {
            self.inner.trigger_fetch();
        }
    }

    /// Detaches from the query. The last detach starts the query's GC
    /// timer.
    pub fn unsubscribe(&self) {
        self.inner.detach();
    }

    /// Detaches and removes the query from the cache immediately.
    pub fn remove(&self) {
        self.inner.detach();
        self.inner
            .cache
            .remove_queries(&QueryFilter::exact(self.inner.query.key().clone()));
    }

    /// Imperatively fetches, regardless of staleness or the `enabled`
    /// option, and returns the resulting derived state.
    pub async fn refetch(&self) -> QueryObserverResult<T> {
        let _ = self
            .inner
            .query
            .fetch(self.inner.fetch_fn.clone(), self.inner.options.fetch_policy())
            .await;
        self.result()
    }

    /// The current derived result.
    #[must_use]
    pub fn result(&self) -> QueryObserverResult<T> {
        self.inner.compute()
    }

    /// The current typed data, if any.
    #[must_use]
    pub fn data(&self) -> Option<Arc<T>> {
        self.result().data
    }

    /// The query this observer is bound to.
    #[must_use]
    pub fn query(&self) -> &Arc<Query> {
        &self.inner.query
    }
}

impl<T> Drop for QueryObserver<T> {
    fn drop(&mut self) {
        if self.inner.subscribed.swap(false, Ordering::SeqCst) {
            self.inner.query.detach_observer(self.inner.id);
        }
    }
}
