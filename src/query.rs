//! Per-key query state machine.
//!
//! A [`Query`] owns the latest data or error for one canonical key, the
//! fetch lifecycle around it, and the listener registry its observers
//! register into. Queries are created and destroyed only by the
//! [`QueryCache`](crate::cache::QueryCache); observers hold non-owning
//! subscriptions.
//!
//! At most one fetch is in flight per query: concurrent fetch requests for
//! the same key attach to the same outcome instead of issuing a second
//! operation.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::CacheShared;
use crate::config::{FetchPolicy, QueryOptions, StaleTime};
use crate::error::QueryError;
use crate::key::{QueryHash, QueryKey};
use crate::retry::Retryer;
use crate::signals::OnlineManager;
use crate::snapshot::DataCodec;

/// Type-erased query data.
///
/// Data is replaced wholesale on every update, so a subscriber holding a
/// previous `Arc` is never exposed to a torn read.
pub type QueryData = Arc<dyn Any + Send + Sync>;

/// A boxed future produced by a fetch function.
pub type FetchFuture = BoxFuture<'static, Result<QueryData, QueryError>>;

/// A type-erased fetch function.
///
/// Typed entry points ([`QueryObserver`](crate::observer::QueryObserver),
/// [`InfiniteQueryObserver`](crate::infinite::InfiniteQueryObserver)) wrap
/// the caller's typed async function into this form.
pub type FetchFn = Arc<dyn Fn(FetchContext) -> FetchFuture + Send + Sync>;

/// Context handed to a fetch function.
#[derive(Clone)]
pub struct FetchContext {
    /// The resolved key of the query being fetched.
    pub key: QueryKey,
    /// The current page parameter, for paginated fetches.
    pub page_param: Option<QueryData>,
    /// Fires when the fetch is cancelled. An operation that wants paused
    /// retries to work correctly must surface cancellation as
    /// [`QueryError::Cancelled`], not as a domain failure.
    pub cancel: CancellationToken,
}

/// Result lifecycle of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    /// No fetch was ever requested (e.g. all observers disabled).
    Idle,
    /// The first fetch is running and no data exists yet.
    Loading,
    /// The latest fetch cycle produced data.
    Success,
    /// The latest fetch cycle failed. Previously fetched data, if any, is
    /// still retained.
    Error,
}

/// Fetch activity of a query, orthogonal to [`QueryStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// No fetch in flight.
    Idle,
    /// A fetch (or one of its retries) is running.
    Fetching,
    /// A fetch wants to run but is parked on lost connectivity.
    Paused,
}

/// A point-in-time copy of a query's state.
#[derive(Clone)]
pub struct QueryState {
    /// Result lifecycle.
    pub status: QueryStatus,
    /// Fetch activity.
    pub fetch_status: FetchStatus,
    /// Last successful payload. Retained across failed refetches.
    pub data: Option<QueryData>,
    /// Last failure. Cleared by the next successful fetch.
    pub error: Option<QueryError>,
    /// When `data` last landed.
    pub data_updated_at: Option<Instant>,
    /// Number of failed fetch cycles recorded so far.
    pub error_update_count: u32,
    /// Set by invalidation; forces staleness until the next success.
    pub is_invalidated: bool,
    /// Wall-clock pair of `data_updated_at`, for the snapshot boundary.
    pub(crate) data_updated_wall_ms: Option<u64>,
    /// `data` still holds the raw snapshot payload and needs a codec to
    /// become typed.
    pub(crate) data_is_hydrated: bool,
}

impl QueryState {
    fn new() -> Self {
        Self {
            status: QueryStatus::Idle,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            data_updated_at: None,
            error_update_count: 0,
            is_invalidated: false,
            data_updated_wall_ms: None,
            data_is_hydrated: false,
        }
    }
}

/// One observer's registration on a query.
pub(crate) struct ObserverEntry {
    pub id: u64,
    pub enabled: bool,
    pub stale_time: StaleTime,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    pub policy: FetchPolicy,
    /// Recompute-and-deliver hook; called in subscription order after every
    /// state change, once the state is fully applied.
    pub notify: Arc<dyn Fn() + Send + Sync>,
}

/// Background-refetch triggers the cache reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefetchTrigger {
    Focus,
    Reconnect,
}

struct InFlight {
    token: CancellationToken,
    done: broadcast::Sender<Result<QueryData, QueryError>>,
}

enum FetchJoin {
    Existing(broadcast::Receiver<Result<QueryData, QueryError>>),
    Started {
        token: CancellationToken,
        done: broadcast::Sender<Result<QueryData, QueryError>>,
        rx: broadcast::Receiver<Result<QueryData, QueryError>>,
    },
}

/// Cached result (or in-flight attempt) for one canonical key.
pub struct Query {
    key: QueryKey,
    hash: QueryHash,
    cache: Weak<CacheShared>,
    online: OnlineManager,
    state: Mutex<QueryState>,
    observers: Mutex<Vec<ObserverEntry>>,
    inflight: Mutex<Option<InFlight>>,
    fetch_fn: Mutex<Option<FetchFn>>,
    gc_token: Mutex<Option<CancellationToken>>,
    cache_time: Mutex<Duration>,
    codec: Mutex<Option<Arc<DataCodec>>>,
}

impl Query {
    pub(crate) fn new(
        key: QueryKey,
        options: &QueryOptions,
        cache: Weak<CacheShared>,
        online: OnlineManager,
    ) -> Arc<Self> {
        let hash = key.hash_key();
        let mut state = QueryState::new();

        if let Some(initial) = options.initial_data.clone() {
            let updated_at = options.initial_data_updated_at.unwrap_or_else(Instant::now);
            state.data = Some(initial);
            state.status = QueryStatus::Success;
            state.data_updated_at = Some(updated_at);
            state.data_updated_wall_ms = Some(wall_ms_for(updated_at));
        }

        debug!(key = %key, "creating query");
        Arc::new(Self {
            key,
            hash,
            cache,
            online,
            state: Mutex::new(state),
            observers: Mutex::new(Vec::new()),
            inflight: Mutex::new(None),
            fetch_fn: Mutex::new(None),
            gc_token: Mutex::new(None),
            cache_time: Mutex::new(options.cache_time),
            codec: Mutex::new(options.codec.clone()),
        })
    }

    /// The key this query is stored under.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The canonical hash this query is stored under.
    #[must_use]
    pub fn hash(&self) -> QueryHash {
        self.hash
    }

    /// A copy of the current state.
    #[must_use]
    pub fn state(&self) -> QueryState {
        self.state.lock().clone()
    }

    /// Number of attached observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Returns `true` if at least one observer is attached.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.observer_count() > 0
    }

    /// Returns `true` if the cached data is stale under `stale_time`.
    ///
    /// Invalidated or missing data is always stale; otherwise the data is
    /// stale once strictly older than the window, and a zero window means
    /// stale as soon as it lands.
    #[must_use]
    pub fn is_stale(&self, stale_time: StaleTime) -> bool {
        let state = self.state.lock();
        if state.is_invalidated {
            return true;
        }
        let Some(updated_at) = state.data_updated_at else {
            return true;
        };
        match stale_time {
            StaleTime::Never => false,
            StaleTime::After(window) if window.is_zero() => true,
            StaleTime::After(window) => updated_at.elapsed() > window,
        }
    }

    /// Starts a fetch, or joins the in-flight one.
    ///
    /// The returned future resolves with the terminal outcome of the
    /// underlying fetch cycle; every concurrent caller observes the same
    /// outcome. The fetch function is remembered for observer-less
    /// refetches (invalidation, focus, reconnect).
    pub(crate) fn fetch(
        self: &Arc<Self>,
        fetch_fn: FetchFn,
        policy: FetchPolicy,
    ) -> impl Future<Output = Result<QueryData, QueryError>> + Send + 'static {
        self.fetch_inner(fetch_fn, policy, true)
    }

    /// Like [`fetch`](Self::fetch), but for one-shot operations (e.g.
    /// appending a page) that must not become the query's standing fetch
    /// function.
    pub(crate) fn fetch_ephemeral(
        self: &Arc<Self>,
        fetch_fn: FetchFn,
        policy: FetchPolicy,
    ) -> impl Future<Output = Result<QueryData, QueryError>> + Send + 'static {
        self.fetch_inner(fetch_fn, policy, false)
    }

    fn fetch_inner(
        self: &Arc<Self>,
        fetch_fn: FetchFn,
        policy: FetchPolicy,
        remember: bool,
    ) -> impl Future<Output = Result<QueryData, QueryError>> + Send + 'static {
        let join = {
            let mut slot = self.inflight.lock();
            if let Some(inflight) = slot.as_ref() {
                FetchJoin::Existing(inflight.done.subscribe())
            } else {
                let token = CancellationToken::new();
                let (done, rx) = broadcast::channel(1);
                *slot = Some(InFlight {
                    token: token.clone(),
                    done: done.clone(),
                });
                FetchJoin::Started { token, done, rx }
            }
        };

        let mut rx = match join {
            FetchJoin::Existing(rx) => {
                trace!(key = %self.key, "joining in-flight fetch");
                rx
            }
            FetchJoin::Started { token, done, rx } => {
                if remember {
                    *self.fetch_fn.lock() = Some(fetch_fn.clone());
                }
                self.begin_fetch();
                self.spawn_fetch_task(fetch_fn, policy, token, done);
                rx
            }
        };

        async move {
            match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(QueryError::Cancelled),
            }
        }
    }

    fn spawn_fetch_task(
        self: &Arc<Self>,
        fetch_fn: FetchFn,
        policy: FetchPolicy,
        token: CancellationToken,
        done: broadcast::Sender<Result<QueryData, QueryError>>,
    ) {
        let query = Arc::clone(self);
        tokio::spawn(async move {
            let retryer = Retryer::new(policy, token.clone(), query.online.clone());

            let op = {
                let key = query.key.clone();
                let token = token.clone();
                move |_failures: u32| {
                    fetch_fn(FetchContext {
                        key: key.clone(),
                        page_param: None,
                        cancel: token.clone(),
                    })
                }
            };
            let on_pause = {
                let query = Arc::clone(&query);
                move |paused: bool| query.set_paused(paused)
            };

            let result = retryer.run(op, on_pause).await;
            query.finish_fetch(&result);
            let _ = done.send(result);
        });
    }

    /// Refetches with the most recently used fetch function, if any.
    ///
    /// Used for invalidation, imperative bulk refetch, and focus/reconnect
    /// triggers, where no observer is handing a fetch function in.
    pub(crate) fn refetch_stored(
        self: &Arc<Self>,
    ) -> Option<impl Future<Output = Result<QueryData, QueryError>> + Send + 'static> {
        let fetch_fn = self.fetch_fn.lock().clone()?;
        Some(self.fetch(fetch_fn, self.refetch_policy()))
    }

    /// The retry policy bulk refetches run under: the first enabled
    /// observer's, or the default.
    fn refetch_policy(&self) -> FetchPolicy {
        self.observers
            .lock()
            .iter()
            .find(|entry| entry.enabled)
            .map(|entry| entry.policy.clone())
            .unwrap_or_default()
    }

    /// Cancels the in-flight fetch, if any. Observers stay attached and the
    /// status is left as-is unless no data ever landed.
    pub fn cancel(&self) {
        if let Some(inflight) = self.inflight.lock().as_ref() {
            trace!(key = %self.key, "cancelling in-flight fetch");
            inflight.token.cancel();
        }
    }

    /// Marks the data stale regardless of any staleness window.
    pub(crate) fn invalidate(&self) {
        self.state.lock().is_invalidated = true;
        self.notify_observers();
    }

    /// Writes data directly, bypassing the fetch path.
    pub(crate) fn set_data(&self, data: QueryData) {
        {
            let mut state = self.state.lock();
            state.data = Some(data);
            state.data_updated_at = Some(Instant::now());
            state.data_updated_wall_ms = Some(unix_ms_now());
            state.data_is_hydrated = false;
            state.status = QueryStatus::Success;
            state.error = None;
            state.is_invalidated = false;
        }
        self.notify_observers();
    }

    /// Seeds the query with a raw snapshot payload.
    pub(crate) fn seed_hydrated(&self, raw: QueryData, wall_ms: u64) {
        let mut state = self.state.lock();
        state.data = Some(raw);
        state.data_updated_at = Some(instant_from_wall_ms(wall_ms));
        state.data_updated_wall_ms = Some(wall_ms);
        state.data_is_hydrated = true;
        state.status = QueryStatus::Success;
        state.error = None;
    }

    /// Swaps a raw snapshot payload for its decoded value, keeping the
    /// recorded timestamps.
    pub(crate) fn replace_hydrated(&self, data: QueryData) {
        let mut state = self.state.lock();
        if state.data_is_hydrated {
            state.data = Some(data);
            state.data_is_hydrated = false;
        }
    }

    /// Decodes a raw snapshot payload in place, if one is present and a
    /// codec is available. `codec` takes precedence over the query's own.
    pub(crate) fn revive_hydrated(&self, codec: Option<Arc<DataCodec>>) {
        let raw = {
            let state = self.state.lock();
            if !state.data_is_hydrated {
                return;
            }
            state.data.clone()
        };
        let Some(codec) = codec.or_else(|| self.codec()) else {
            return;
        };
        let Some(raw) = raw else { return };
        let Ok(value) = raw.downcast::<serde_json::Value>() else {
            return;
        };
        if let Some(decoded) = codec.decode(&value) {
            trace!(key = %self.key, "reviving hydrated payload");
            self.replace_hydrated(decoded);
        }
    }

    pub(crate) fn codec(&self) -> Option<Arc<DataCodec>> {
        self.codec.lock().clone()
    }

    pub(crate) fn set_codec_if_absent(&self, codec: Option<Arc<DataCodec>>) {
        let Some(codec) = codec else { return };
        let mut slot = self.codec.lock();
        if slot.is_none() {
            *slot = Some(codec);
        }
    }

    pub(crate) fn attach_observer(&self, entry: ObserverEntry, cache_time: Duration) {
        if let Some(token) = self.gc_token.lock().take() {
            token.cancel();
        }
        {
            let mut current = self.cache_time.lock();
            if cache_time > *current {
                *current = cache_time;
            }
        }
        self.observers.lock().push(entry);
    }

    pub(crate) fn detach_observer(self: &Arc<Self>, id: u64) {
        let empty = {
            let mut observers = self.observers.lock();
            observers.retain(|entry| entry.id != id);
            observers.is_empty()
        };
        if empty {
            self.schedule_gc();
        }
    }

    /// Schedules removal from the cache once `cache_time` elapses without a
    /// new observer attaching.
    ///
    /// Outside a tokio runtime (e.g. an observer dropped after the runtime
    /// shut down) no timer can run; the query then lingers until removed
    /// explicitly.
    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache_time = *self.cache_time.lock();
        let token = CancellationToken::new();
        *self.gc_token.lock() = Some(token.clone());

        let query = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                () = sleep(cache_time) => {
                    let Some(query) = query.upgrade() else { return };
                    if query.observer_count() == 0 {
                        if let Some(cache) = query.cache.upgrade() {
                            debug!(key = %query.key, "garbage-collecting unobserved query");
                            cache.evict(query.hash);
                        }
                    }
                }
            }
        });
    }

    /// Cancels the in-flight fetch and any pending GC timer. Called by the
    /// cache when the query is removed.
    pub(crate) fn shutdown(&self) {
        self.cancel();
        if let Some(token) = self.gc_token.lock().take() {
            token.cancel();
        }
    }

    /// Returns `true` if some enabled observer wants a background refetch
    /// for `trigger` and considers the data stale.
    pub(crate) fn wants_refetch_on(&self, trigger: RefetchTrigger) -> bool {
        let stale_times: Vec<StaleTime> = self
            .observers
            .lock()
            .iter()
            .filter(|entry| {
                entry.enabled
                    && match trigger {
                        RefetchTrigger::Focus => entry.refetch_on_focus,
                        RefetchTrigger::Reconnect => entry.refetch_on_reconnect,
                    }
            })
            .map(|entry| entry.stale_time)
            .collect();
        stale_times
            .into_iter()
            .any(|stale_time| self.is_stale(stale_time))
    }

    /// Returns `true` if at least one attached observer is enabled.
    pub(crate) fn has_enabled_observer(&self) -> bool {
        self.observers.lock().iter().any(|entry| entry.enabled)
    }

    fn begin_fetch(&self) {
        {
            let mut state = self.state.lock();
            state.fetch_status = FetchStatus::Fetching;
            if state.data.is_none() {
                state.status = QueryStatus::Loading;
            }
        }
        self.notify_observers();
    }

    fn set_paused(&self, paused: bool) {
        {
            let mut state = self.state.lock();
            state.fetch_status = if paused {
                FetchStatus::Paused
            } else {
                FetchStatus::Fetching
            };
        }
        self.notify_observers();
    }

    fn finish_fetch(&self, result: &Result<QueryData, QueryError>) {
        {
            let mut state = self.state.lock();
            state.fetch_status = FetchStatus::Idle;
            match result {
                Ok(data) => {
                    state.data = Some(data.clone());
                    state.data_updated_at = Some(Instant::now());
                    state.data_updated_wall_ms = Some(unix_ms_now());
                    state.data_is_hydrated = false;
                    state.error = None;
                    state.status = QueryStatus::Success;
                    state.is_invalidated = false;
                }
                Err(QueryError::Cancelled) => {
                    // Cancellation only reports as an error when nothing
                    // ever succeeded; otherwise the last result stands.
                    if state.data.is_none() && state.status == QueryStatus::Loading {
                        state.status = QueryStatus::Error;
                        state.error = Some(QueryError::Cancelled);
                        state.error_update_count += 1;
                    }
                }
                Err(error) => {
                    state.error = Some(error.clone());
                    state.error_update_count += 1;
                    state.status = QueryStatus::Error;
                }
            }
        }
        *self.inflight.lock() = None;
        self.notify_observers();
    }

    /// Calls every observer's notify hook in subscription order.
    ///
    /// The hooks run outside the state lock, after the state is fully
    /// applied.
    pub(crate) fn notify_observers(&self) {
        let hooks: Vec<Arc<dyn Fn() + Send + Sync>> = self
            .observers
            .lock()
            .iter()
            .map(|entry| entry.notify.clone())
            .collect();
        for hook in hooks {
            hook();
        }
    }
}

pub(crate) fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn wall_ms_for(updated_at: Instant) -> u64 {
    let age = updated_at.elapsed();
    unix_ms_now().saturating_sub(u64::try_from(age.as_millis()).unwrap_or(u64::MAX))
}

fn instant_from_wall_ms(wall_ms: u64) -> Instant {
    let age = Duration::from_millis(unix_ms_now().saturating_sub(wall_ms));
    Instant::now().checked_sub(age).unwrap_or_else(Instant::now)
}
