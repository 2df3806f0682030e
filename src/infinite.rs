//! Paginated queries: an ordered sequence of pages under one key.
//!
//! An infinite query's data is an [`InfiniteData`]: parallel vectors of
//! page payloads and the page parameters they were fetched with. The
//! recorded parameters make a full refetch reproducible: every existing
//! page is re-fetched sequentially with its original parameter, preserving
//! the page count.
//!
//! # Example
//!
//! ```rust,ignore
//! let observer = InfiniteQueryObserver::new(
//!     client.cache(),
//!     query_key!["users"],
//!     |_ctx, page: u32| async move { api.fetch_users(page).await },
//!     0,
//!     |last, _all| (last.page < last.total_pages).then(|| last.page + 1),
//!     QueryOptions::default(),
//! );
//! observer.subscribe(|_| {});
//! // ...
//! observer.fetch_next_page().await;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::cache::QueryCache;
use crate::config::{FetchPolicy, QueryOptions};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::observer::{QueryObserver, QueryObserverResult};
use crate::query::{FetchContext, FetchFn, FetchStatus, Query, QueryData, QueryStatus};

/// The pages fetched so far, with the parameter each page was fetched
/// under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfiniteData<T, P> {
    /// Page payloads, in fetch order.
    pub pages: Vec<T>,
    /// The parameter each page in `pages` was fetched with.
    pub params: Vec<P>,
}

impl<T, P> InfiniteData<T, P> {
    /// Number of fetched pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if no page was fetched yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// The derived result of an [`InfiniteQueryObserver`].
pub struct InfiniteQueryObserverResult<T, P> {
    /// Result lifecycle of the underlying query.
    pub status: QueryStatus,
    /// Fetch activity of the underlying query.
    pub fetch_status: FetchStatus,
    /// The fetched pages, if any.
    pub data: Option<Arc<InfiniteData<T, P>>>,
    /// The last failure, if the latest fetch cycle failed.
    pub error: Option<QueryError>,
    /// Whether the data is stale under this observer's staleness window.
    pub is_stale: bool,
    /// Whether another page can be fetched.
    pub has_next_page: bool,
    /// Whether a [`fetch_next_page`](InfiniteQueryObserver::fetch_next_page)
    /// call is in flight.
    pub is_fetching_next_page: bool,
}

impl<T, P> InfiniteQueryObserverResult<T, P> {
    /// Returns `true` if a fetch is in flight (including paused).
    #[must_use]
    pub const fn is_fetching(&self) -> bool {
        !matches!(self.fetch_status, FetchStatus::Idle)
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
}

type PageFetchFn<T, P> =
    Arc<dyn Fn(FetchContext, P) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;
type GetNextPageParam<T, P> = Arc<dyn Fn(&T, &[T]) -> Option<P> + Send + Sync>;

/// A subscription to a paginated query.
///
/// Wraps a [`QueryObserver`] over [`InfiniteData`]: subscription,
/// staleness, deduplication, and notification behave exactly like a plain
/// query, while [`fetch_next_page`](Self::fetch_next_page) grows the page
/// sequence one page at a time.
pub struct InfiniteQueryObserver<T, P> {
    observer: QueryObserver<InfiniteData<T, P>>,
    page_fetch: PageFetchFn<T, P>,
    get_next_page_param: GetNextPageParam<T, P>,
    initial_page_param: P,
    policy: FetchPolicy,
    fetching_next: Arc<AtomicBool>,
}

impl<T, P> InfiniteQueryObserver<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Creates an observer for a paginated query.
    ///
    /// `fetch` receives the fetch context and the page parameter for the
    /// page it should produce. `get_next_page_param` derives the next
    /// parameter from the last page and all pages, or `None` when the
    /// sequence is exhausted.
    pub fn new<K, F, Fut, G>(
        cache: &QueryCache,
        key: K,
        fetch: F,
        initial_page_param: P,
        get_next_page_param: G,
        options: QueryOptions,
    ) -> Self
    where
        K: Into<QueryKey>,
        F: Fn(FetchContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
        G: Fn(&T, &[T]) -> Option<P> + Send + Sync + 'static,
    {
        let key = key.into();
        let page_fetch: PageFetchFn<T, P> =
            Arc::new(move |ctx, param| Box::pin(fetch(ctx, param)));
        let policy = options.fetch_policy();

        // The standing fetch function refetches every recorded page with
        // its original parameter; on a brand-new query it fetches the
        // first page.
        let query = cache.get_or_create(key.clone(), &options);
        let standing = {
            let page_fetch = page_fetch.clone();
            let initial = initial_page_param.clone();
            let query = Arc::downgrade(&query);
            move |ctx: FetchContext| {
                let params = recorded_params::<T, P>(&query)
                    .unwrap_or_else(|| vec![initial.clone()]);
                let page_fetch = page_fetch.clone();
                async move {
                    let mut pages = Vec::with_capacity(params.len());
                    for param in &params {
                        let page = page_fetch(
                            page_context(&ctx, param.clone()),
                            param.clone(),
                        )
                        .await?;
                        pages.push(page);
                    }
                    Ok(InfiniteData { pages, params })
                }
            }
        };

        Self {
            observer: QueryObserver::new(cache, key, standing, options),
            page_fetch,
            get_next_page_param: Arc::new(get_next_page_param),
            initial_page_param,
            policy,
            fetching_next: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attaches to the query and starts receiving results; fetches the
    /// first page if nothing fresh is cached. See
    /// [`QueryObserver::subscribe`].
    pub fn subscribe<F>(&self, on_change: F)
    where
        F: Fn(QueryObserverResult<InfiniteData<T, P>>) + Send + Sync + 'static,
    {
        self.observer.subscribe(on_change);
    }

    /// Detaches from the query.
    pub fn unsubscribe(&self) {
        self.observer.unsubscribe();
    }

    /// Fetches one more page and appends it to the sequence.
    ///
    /// No-op when `get_next_page_param` reports the sequence exhausted.
    /// Joins any fetch already in flight on the query, so concurrent calls
    /// append a single page.
    pub async fn fetch_next_page(&self) -> InfiniteQueryObserverResult<T, P> {
        let current = self.data();
        let next_param = match current.as_deref() {
            None => Some(self.initial_page_param.clone()),
            Some(data) if data.pages.is_empty() => Some(self.initial_page_param.clone()),
            Some(data) => match data.pages.last() {
                Some(last) => (self.get_next_page_param)(last, &data.pages),
                None => None,
            },
        };
        let Some(param) = next_param else {
            return self.result();
        };

        self.fetching_next.store(true, Ordering::SeqCst);
        let append = self.append_fetch_fn(current, param);
        let _ = self
            .observer
            .query()
            .fetch_ephemeral(append, self.policy.clone())
            .await;
        self.fetching_next.store(false, Ordering::SeqCst);

        self.result()
    }

    /// Refetches every recorded page with its original parameter,
    /// preserving the page count.
    pub async fn refetch(&self) -> InfiniteQueryObserverResult<T, P> {
        let _ = self.observer.refetch().await;
        self.result()
    }

    /// The current derived result.
    #[must_use]
    pub fn result(&self) -> InfiniteQueryObserverResult<T, P> {
        let base = self.observer.result();
        let has_next_page = match base.data.as_deref() {
            None => true,
            Some(data) if data.pages.is_empty() => true,
            Some(data) => match data.pages.last() {
                Some(last) => (self.get_next_page_param)(last, &data.pages).is_some(),
                None => false,
            },
        };
        InfiniteQueryObserverResult {
            status: base.status,
            fetch_status: base.fetch_status,
            data: base.data,
            error: base.error,
            is_stale: base.is_stale,
            has_next_page,
            is_fetching_next_page: self.fetching_next.load(Ordering::SeqCst),
        }
    }

    /// The current pages, if any.
    #[must_use]
    pub fn data(&self) -> Option<Arc<InfiniteData<T, P>>> {
        self.observer.data()
    }

    /// The query this observer is bound to.
    #[must_use]
    pub fn query(&self) -> &Arc<Query> {
        self.observer.query()
    }

    /// A one-shot fetch function that fetches `param`'s page and appends
    /// it to `current`.
    fn append_fetch_fn(&self, current: Option<Arc<InfiniteData<T, P>>>, param: P) -> FetchFn {
        let page_fetch = self.page_fetch.clone();
        Arc::new(move |ctx: FetchContext| {
            let page_fetch = page_fetch.clone();
            let param = param.clone();
            let current = current.clone();
            Box::pin(async move {
                let page = page_fetch(page_context(&ctx, param.clone()), param.clone()).await?;
                let (mut pages, mut params) = match current.as_deref() {
                    Some(data) => (data.pages.clone(), data.params.clone()),
                    None => (Vec::new(), Vec::new()),
                };
                pages.push(page);
                params.push(param);
                Ok(Arc::new(InfiniteData { pages, params }) as QueryData)
            })
        })
    }
}

/// The parameters recorded in a query's current pages, if any.
fn recorded_params<T, P>(query: &Weak<Query>) -> Option<Vec<P>>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    let data = query.upgrade()?.state().data?;
    let data = data.downcast::<InfiniteData<T, P>>().ok()?;
    (!data.params.is_empty()).then(|| data.params.clone())
}

/// Rebuilds a fetch context carrying `param` as the page parameter.
fn page_context<P: Clone + Send + Sync + 'static>(ctx: &FetchContext, param: P) -> FetchContext {
    FetchContext {
        key: ctx.key.clone(),
        page_param: Some(Arc::new(param) as QueryData),
        cancel: ctx.cancel.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::time::timeout;

    /// A page of fake users, `per_page` ids starting at `page * per_page`.
    fn page_of(page: u32, per_page: u32) -> Vec<u32> {
        (page * per_page..(page + 1) * per_page).collect()
    }

    fn users_observer(
        cache: &QueryCache,
        total_pages: u32,
        fetch_log: Arc<Mutex<Vec<u32>>>,
    ) -> InfiniteQueryObserver<Vec<u32>, u32> {
        InfiniteQueryObserver::new(
            cache,
            query_key!["users"],
            move |_ctx, page: u32| {
                fetch_log.lock().push(page);
                async move { Ok(page_of(page, 3)) }
            },
            0,
            move |_last, all| {
                let fetched = u32::try_from(all.len()).unwrap_or(u32::MAX);
                (fetched < total_pages).then_some(fetched)
            },
            QueryOptions::default(),
        )
    }

    async fn settled<T, P>(observer: &InfiniteQueryObserver<T, P>)
    where
        T: Clone + Send + Sync + 'static,
        P: Clone + Send + Sync + 'static,
    {
        timeout(Duration::from_secs(1), async {
            loop {
                if !observer.result().is_fetching() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("query should settle");
    }

    #[tokio::test]
    async fn test_subscribe_fetches_first_page() {
        let cache = QueryCache::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let observer = users_observer(&cache, 3, log.clone());

        observer.subscribe(|_| {});
        settled(&observer).await;

        let result = observer.result();
        assert!(result.is_success());
        let data = result.data.expect("first page should be fetched");
        assert_eq!(data.pages, vec![page_of(0, 3)]);
        assert_eq!(data.params, vec![0]);
        assert!(result.has_next_page);
        assert_eq!(*log.lock(), vec![0]);
    }

    #[tokio::test]
    async fn test_fetch_next_page_appends_in_order() {
        let cache = QueryCache::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let observer = users_observer(&cache, 3, log.clone());

        observer.subscribe(|_| {});
        settled(&observer).await;

        let result = observer.fetch_next_page().await;
        assert_eq!(
            result.data.as_ref().expect("two pages").pages,
            vec![page_of(0, 3), page_of(1, 3)]
        );
        assert!(result.has_next_page);

        let result = observer.fetch_next_page().await;
        let data = result.data.expect("three pages");
        assert_eq!(data.pages.len(), 3);
        assert_eq!(data.params, vec![0, 1, 2]);
        assert!(!result.has_next_page, "sequence is exhausted");
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_fetch_next_page_noop_when_exhausted() {
        let cache = QueryCache::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let observer = users_observer(&cache, 1, log.clone());

        observer.subscribe(|_| {});
        settled(&observer).await;
        assert!(!observer.result().has_next_page);

        let result = observer.fetch_next_page().await;
        assert_eq!(result.data.expect("one page").pages.len(), 1);
        assert_eq!(*log.lock(), vec![0], "no extra fetch was issued");
    }

    #[tokio::test]
    async fn test_refetch_preserves_page_count_and_params() {
        let cache = QueryCache::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let observer = users_observer(&cache, 5, log.clone());

        observer.subscribe(|_| {});
        settled(&observer).await;
        observer.fetch_next_page().await;
        observer.fetch_next_page().await;
        assert_eq!(observer.data().expect("three pages").pages.len(), 3);

        log.lock().clear();
        let result = observer.refetch().await;

        let data = result.data.expect("refetched pages");
        assert_eq!(data.pages.len(), 3, "page count is preserved");
        assert_eq!(data.params, vec![0, 1, 2]);
        // Every page was re-fetched sequentially with its original param.
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_is_fetching_next_page_flag() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));

        let observer = InfiniteQueryObserver::new(
            &cache,
            query_key!["slow"],
            {
                let release_rx = release_rx.clone();
                move |_ctx, page: u32| {
                    let gate = if page > 0 {
                        release_rx.lock().take()
                    } else {
                        None
                    };
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if let Some(rx) = gate {
                            let _ = rx.await;
                        }
                        Ok(vec![page])
                    }
                }
            },
            0u32,
            |_last, all| Some(u32::try_from(all.len()).unwrap_or(u32::MAX)),
            QueryOptions::default(),
        );

        observer.subscribe(|_| {});
        settled(&observer).await;
        assert!(!observer.result().is_fetching_next_page);

        // Poll the next-page future once so the fetch starts, then observe
        // the flag mid-flight.
        let mut next = Box::pin(observer.fetch_next_page());
        tokio::select! {
            _ = &mut next => panic!("gated fetch should not complete yet"),
            () = tokio::task::yield_now() => {}
        }
        assert!(observer.result().is_fetching_next_page);

        release_tx.send(()).expect("fetch should be waiting");
        let result = next.await;
        assert!(!result.is_fetching_next_page);
        assert_eq!(result.data.expect("two pages").pages.len(), 2);
    }
}
