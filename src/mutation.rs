//! Mutations: tracked asynchronous write operations.
//!
//! Unlike queries, mutations are never deduplicated: every
//! [`mutate`](Mutation::mutate) call appends an independent
//! [`MutationRecord`] to the [`MutationCache`], in creation order. After a
//! successful mutation you typically invalidate related queries so they
//! refetch.
//!
//! The callback lifecycle mirrors the read side's stale-while-revalidate
//! contract but for writes: `on_mutate` runs synchronously before the
//! operation and returns a *context* value (commonly a snapshot for
//! rollback), which is threaded by value into `on_success`/`on_error` and
//! then `on_settled`; success/error always fire before settled.
//!
//! # Optimistic updates
//!
//! ```rust,ignore
//! let mutation = Mutation::with_context(
//!     client.mutations(),
//!     move |todo: Todo| { let api = api.clone(); async move { api.update(todo).await } },
//!     {
//!         let client = client.clone();
//!         move |todo| {
//!             // Cancel outgoing refetches so they don't clobber the
//!             // optimistic write, snapshot, then write speculatively.
//!             client.cancel_queries(&QueryFilter::exact(query_key!["todos"]));
//!             let previous = client.get_query_data::<Vec<Todo>>(&query_key!["todos"]);
//!             client.set_query_data(&query_key!["todos"], updated_with(todo));
//!             previous
//!         }
//!     },
//! )
//! .with_on_error({
//!     let client = client.clone();
//!     move |_err, _todo, previous| {
//!         if let Some(previous) = previous {
//!             client.set_query_data(&query_key!["todos"], (**previous).clone());
//!         }
//!     }
//! });
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::FetchPolicy;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::query::QueryData;
use crate::retry::Retryer;
use crate::signals::OnlineManager;

/// Lifecycle of a single mutation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Not started, or reset.
    Idle,
    /// The operation (or one of its retries) is running.
    Loading,
    /// The operation produced data.
    Success,
    /// The operation failed after exhausting its retries.
    Error,
}

struct RecordState {
    status: MutationStatus,
    variables: Option<QueryData>,
    data: Option<QueryData>,
    error: Option<QueryError>,
}

/// One tracked mutation run, retained by the [`MutationCache`] for
/// introspection and filtering.
pub struct MutationRecord {
    id: u64,
    key: Option<QueryKey>,
    state: Mutex<RecordState>,
}

impl MutationRecord {
    fn new(id: u64, key: Option<QueryKey>) -> Arc<Self> {
        Arc::new(Self {
            id,
            key,
            state: Mutex::new(RecordState {
                status: MutationStatus::Idle,
                variables: None,
                data: None,
                error: None,
            }),
        })
    }

    /// Monotonic id, in creation order.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The mutation key used for filtering, if any. Never used for
    /// deduplication.
    #[must_use]
    pub fn key(&self) -> Option<&QueryKey> {
        self.key.as_ref()
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> MutationStatus {
        self.state.lock().status
    }

    /// The variables of this run, if they are of type `V`.
    #[must_use]
    pub fn variables<V: Send + Sync + 'static>(&self) -> Option<Arc<V>> {
        self.state.lock().variables.clone()?.downcast::<V>().ok()
    }

    /// The result of this run, if completed and of type `D`.
    #[must_use]
    pub fn data<D: Send + Sync + 'static>(&self) -> Option<Arc<D>> {
        self.state.lock().data.clone()?.downcast::<D>().ok()
    }

    /// The terminal error of this run, if it failed.
    #[must_use]
    pub fn error(&self) -> Option<QueryError> {
        self.state.lock().error.clone()
    }

    fn begin(&self, variables: QueryData) {
        let mut state = self.state.lock();
        state.status = MutationStatus::Loading;
        state.variables = Some(variables);
    }

    fn complete(&self, data: QueryData) {
        let mut state = self.state.lock();
        state.status = MutationStatus::Success;
        state.data = Some(data);
        state.error = None;
    }

    fn fail(&self, error: QueryError) {
        let mut state = self.state.lock();
        state.status = MutationStatus::Error;
        state.error = Some(error);
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.status = MutationStatus::Idle;
        state.data = None;
        state.error = None;
    }

    fn is_settled(&self) -> bool {
        matches!(
            self.status(),
            MutationStatus::Success | MutationStatus::Error
        )
    }
}

impl fmt::Debug for MutationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationRecord")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &self.status())
            .finish()
    }
}

/// Selects mutation records for introspection.
///
/// Key and predicate constraints combine with AND semantics; a record
/// without a key never matches a key filter.
#[derive(Clone, Default)]
pub struct MutationFilter {
    key: Option<QueryKey>,
    exact: bool,
    predicate: Option<Arc<dyn Fn(&MutationRecord) -> bool + Send + Sync>>,
}

impl MutationFilter {
    /// Matches every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches records whose mutation key starts with `key`.
    #[must_use]
    pub fn prefix(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Matches records keyed exactly `key`.
    #[must_use]
    pub fn exact(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            exact: true,
            ..Self::default()
        }
    }

    /// Adds a predicate over the full record (status, variables, result),
    /// ANDed with the key constraint.
    #[must_use]
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&MutationRecord) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    fn matches(&self, record: &MutationRecord) -> bool {
        if let Some(key) = &self.key {
            let matched = record.key().is_some_and(|stored| {
                if self.exact {
                    stored.matches_exact(key)
                } else {
                    stored.matches_prefix(key)
                }
            });
            if !matched {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(record) {
                return false;
            }
        }
        true
    }
}

impl fmt::Debug for MutationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationFilter")
            .field("key", &self.key)
            .field("exact", &self.exact)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

struct MutationCacheShared {
    records: Mutex<Vec<Arc<MutationRecord>>>,
    next_id: AtomicU64,
    retain_limit: usize,
    online: OnlineManager,
}

/// Ordered registry of mutation records.
///
/// Records are appended in creation order and never deduplicated. Settled
/// records beyond the retention limit are pruned oldest-first; in-flight
/// records are always retained.
#[derive(Clone)]
pub struct MutationCache {
    shared: Arc<MutationCacheShared>,
}

impl MutationCache {
    /// Default number of settled records kept for introspection.
    pub const DEFAULT_RETAIN_LIMIT: usize = 64;

    /// Creates an empty mutation cache with its own connectivity signal.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(OnlineManager::new(), Self::DEFAULT_RETAIN_LIMIT)
    }

    /// Creates an empty mutation cache sharing `online` and keeping at most
    /// `retain_limit` settled records.
    #[must_use]
    pub fn with_parts(online: OnlineManager, retain_limit: usize) -> Self {
        Self {
            shared: Arc::new(MutationCacheShared {
                records: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                retain_limit,
                online,
            }),
        }
    }

    fn register(&self, key: Option<QueryKey>) -> Arc<MutationRecord> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let record = MutationRecord::new(id, key);
        self.shared.records.lock().push(record.clone());
        record
    }

    /// A snapshot of all retained records, in creation order.
    #[must_use]
    pub fn records(&self) -> Vec<Arc<MutationRecord>> {
        self.shared.records.lock().clone()
    }

    /// Number of in-flight mutations matching `filter`.
    #[must_use]
    pub fn is_mutating(&self, filter: &MutationFilter) -> usize {
        self.shared
            .records
            .lock()
            .iter()
            .filter(|record| record.status() == MutationStatus::Loading && filter.matches(record))
            .count()
    }

    /// Drops every retained record.
    pub fn clear(&self) {
        self.shared.records.lock().clear();
    }

    /// Prunes settled records oldest-first down to the retention limit.
    fn prune(&self) {
        let mut records = self.shared.records.lock();
        let mut excess = records.len().saturating_sub(self.shared.retain_limit);
        if excess > 0 {
            records.retain(|record| {
                if excess > 0 && record.is_settled() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }

    pub(crate) fn online(&self) -> &OnlineManager {
        &self.shared.online
    }
}

impl Default for MutationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MutationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCache")
            .field("records", &self.shared.records.lock().len())
            .finish()
    }
}

type MutationFn<TVars, TData> =
    Arc<dyn Fn(TVars) -> BoxFuture<'static, Result<TData, QueryError>> + Send + Sync>;
type OnSuccess<TData, TVars, TCtx> = Arc<dyn Fn(&TData, &TVars, &TCtx) + Send + Sync>;
type OnError<TVars, TCtx> = Arc<dyn Fn(&QueryError, &TVars, &TCtx) + Send + Sync>;
type OnSettled<TData, TVars, TCtx> =
    Arc<dyn Fn(Option<&TData>, Option<&QueryError>, &TVars, &TCtx) + Send + Sync>;

/// A configured mutation: the operation plus its callback lifecycle.
///
/// Each call to [`mutate`](Self::mutate) / [`mutate_async`](Self::mutate_async)
/// produces an independent [`MutationRecord`]; the mutation itself tracks
/// only the most recent run.
pub struct Mutation<TVars, TData, TCtx = ()> {
    cache: MutationCache,
    key: Option<QueryKey>,
    policy: FetchPolicy,
    mutation_fn: MutationFn<TVars, TData>,
    make_context: Arc<dyn Fn(&TVars) -> TCtx + Send + Sync>,
    on_success: Option<OnSuccess<TData, TVars, TCtx>>,
    on_error: Option<OnError<TVars, TCtx>>,
    on_settled: Option<OnSettled<TData, TVars, TCtx>>,
    current: Arc<Mutex<Option<Arc<MutationRecord>>>>,
}

impl<TVars, TData> Mutation<TVars, TData, ()>
where
    TVars: Clone + Send + Sync + 'static,
    TData: Clone + Send + Sync + 'static,
{
    /// Creates a mutation with no pre-mutation hook; the context threaded
    /// into the callbacks is `()`.
    pub fn new<F, Fut>(cache: &MutationCache, mutation_fn: F) -> Self
    where
        F: Fn(TVars) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TData, QueryError>> + Send + 'static,
    {
        Self::with_context(cache, mutation_fn, |_| ())
    }
}

impl<TVars, TData, TCtx> Mutation<TVars, TData, TCtx>
where
    TVars: Clone + Send + Sync + 'static,
    TData: Clone + Send + Sync + 'static,
    TCtx: Send + Sync + 'static,
{
    /// Creates a mutation whose `on_mutate` hook runs synchronously before
    /// the operation and produces the context passed into every later
    /// callback.
    pub fn with_context<F, Fut, M>(cache: &MutationCache, mutation_fn: F, on_mutate: M) -> Self
    where
        F: Fn(TVars) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TData, QueryError>> + Send + 'static,
        M: Fn(&TVars) -> TCtx + Send + Sync + 'static,
    {
        let mutation_fn: MutationFn<TVars, TData> =
            Arc::new(move |vars| Box::pin(mutation_fn(vars)));
        Self {
            cache: cache.clone(),
            key: None,
            policy: FetchPolicy {
                // Writes are not retried unless asked to.
                retry: crate::config::RetryPolicy::Count(0),
                retry_delay: crate::config::RetryDelay::default(),
            },
            mutation_fn,
            make_context: Arc::new(on_mutate),
            on_success: None,
            on_error: None,
            on_settled: None,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Tags runs of this mutation with a key, for filtering.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the retry policy for the operation.
    #[must_use]
    pub fn with_retry(mut self, retry: crate::config::RetryPolicy) -> Self {
        self.policy.retry = retry;
        self
    }

    /// Sets the delay schedule between retries.
    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: crate::config::RetryDelay) -> Self {
        self.policy.retry_delay = retry_delay;
        self
    }

    /// Called with the result, the variables, and the context after a
    /// successful run, before `on_settled`.
    #[must_use]
    pub fn with_on_success<F>(mut self, on_success: F) -> Self
    where
        F: Fn(&TData, &TVars, &TCtx) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(on_success));
        self
    }

    /// Called with the terminal error, the variables, and the context after
    /// a failed run, before `on_settled`.
    #[must_use]
    pub fn with_on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&QueryError, &TVars, &TCtx) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Called after every run, success or failure, after the specific
    /// callback.
    #[must_use]
    pub fn with_on_settled<F>(mut self, on_settled: F) -> Self
    where
        F: Fn(Option<&TData>, Option<&QueryError>, &TVars, &TCtx) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(on_settled));
        self
    }

    /// Fires the mutation without waiting for it.
    ///
    /// The pre-mutation hook runs synchronously before this returns; the
    /// terminal error, if any, surfaces only through `on_error`.
    pub fn mutate(&self, variables: TVars) {
        let (record, context) = self.begin(&variables);
        let run = self.execute(record, context, variables);
        tokio::spawn(async move {
            let _ = run.await;
        });
    }

    /// Runs the mutation and returns its terminal result to the caller, in
    /// addition to the callbacks.
    pub async fn mutate_async(&self, variables: TVars) -> Result<TData, QueryError> {
        let (record, context) = self.begin(&variables);
        self.execute(record, context, variables).await
    }

    /// Returns the most recent run to `Idle` without re-running callbacks.
    pub fn reset(&self) {
        if let Some(record) = self.current.lock().take() {
            record.reset();
        }
    }

    /// Status of the most recent run.
    #[must_use]
    pub fn status(&self) -> MutationStatus {
        self.current
            .lock()
            .as_ref()
            .map_or(MutationStatus::Idle, |record| record.status())
    }

    /// Result of the most recent run, if it succeeded.
    #[must_use]
    pub fn data(&self) -> Option<Arc<TData>> {
        self.current.lock().as_ref()?.data::<TData>()
    }

    /// Error of the most recent run, if it failed.
    #[must_use]
    pub fn error(&self) -> Option<QueryError> {
        self.current.lock().as_ref()?.error()
    }

    /// Registers a record and runs the pre-mutation hook, synchronously.
    fn begin(&self, variables: &TVars) -> (Arc<MutationRecord>, TCtx) {
        let record = self.cache.register(self.key.clone());
        *self.current.lock() = Some(record.clone());
        record.begin(Arc::new(variables.clone()));
        debug!(id = record.id(), "mutation started");
        let context = (self.make_context)(variables);
        (record, context)
    }

    fn execute(
        &self,
        record: Arc<MutationRecord>,
        context: TCtx,
        variables: TVars,
    ) -> impl Future<Output = Result<TData, QueryError>> + Send + 'static {
        let cache = self.cache.clone();
        let policy = self.policy.clone();
        let mutation_fn = self.mutation_fn.clone();
        let on_success = self.on_success.clone();
        let on_error = self.on_error.clone();
        let on_settled = self.on_settled.clone();

        async move {
            let retryer = Retryer::new(policy, CancellationToken::new(), cache.online().clone());
            let op = {
                let vars = variables.clone();
                move |_failures: u32| mutation_fn(vars.clone())
            };
            let result = retryer.run(op, |_| {}).await;

            match &result {
                Ok(data) => {
                    record.complete(Arc::new(data.clone()));
                    if let Some(callback) = &on_success {
                        callback(data, &variables, &context);
                    }
                    if let Some(callback) = &on_settled {
                        callback(Some(data), None, &variables, &context);
                    }
                }
                Err(error) => {
                    debug!(id = record.id(), %error, "mutation failed");
                    record.fail(error.clone());
                    if let Some(callback) = &on_error {
                        callback(error, &variables, &context);
                    }
                    if let Some(callback) = &on_settled {
                        callback(None, Some(error), &variables, &context);
                    }
                }
            }
            cache.prune();
            result
        }
    }
}
