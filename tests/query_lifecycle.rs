// Integration tests for the fetch lifecycle: deduplication, staleness,
// retries, cancellation, and connectivity pauses.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use requery::prelude::*;
use tokio::time::timeout;

fn counting_fetcher(
    calls: Arc<AtomicU32>,
) -> impl Fn(FetchContext) -> futures::future::BoxFuture<'static, Result<u32, QueryError>>
       + Send
       + Sync
       + 'static {
    move |_ctx| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move { Ok(n) })
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition should hold within the timeout");
}

#[tokio::test]
async fn test_concurrent_observers_issue_one_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    let fetcher = {
        let calls = calls.clone();
        move |_ctx: FetchContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok("payload".to_string())
            }
        }
    };

    // Two consumers race to the same key while no query exists yet.
    let a = QueryObserver::new(
        client.cache(),
        query_key!["profile", 1],
        fetcher.clone(),
        QueryOptions::default(),
    );
    let b = QueryObserver::new(
        client.cache(),
        query_key!["profile", 1],
        fetcher,
        QueryOptions::default(),
    );
    a.subscribe(|_| {});
    b.subscribe(|_| {});

    wait_until(|| a.result().is_success() && b.result().is_success()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data().as_deref().map(String::as_str), Some("payload"));
    assert!(Arc::ptr_eq(
        &a.data().expect("data"),
        &b.data().expect("data")
    ));
}

#[tokio::test]
async fn test_stale_subscribe_shows_cached_data_while_refetching() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    let first = QueryObserver::new(
        client.cache(),
        query_key!["feed"],
        counting_fetcher(calls.clone()),
        QueryOptions::default(),
    );
    first.subscribe(|_| {});
    wait_until(|| first.result().is_success()).await;
    first.unsubscribe();

    // Data is immediately stale (default stale time): a new subscriber
    // sees the cached value at once and a background refetch follows.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let second = QueryObserver::new(
        client.cache(),
        query_key!["feed"],
        counting_fetcher(calls.clone()),
        QueryOptions::default(),
    );
    second.subscribe({
        let seen = seen.clone();
        move |result| {
            seen.lock()
                .push((result.data.as_deref().copied(), result.is_fetching()));
        }
    });

    let initial = seen.lock().first().copied().expect("initial delivery");
    assert_eq!(initial.0, Some(1), "cached data delivered synchronously");

    wait_until(|| calls.load(Ordering::SeqCst) == 2).await;
    wait_until(|| second.data().as_deref() == Some(&2)).await;
    // The view never blanked: every delivery carried data.
    assert!(seen.lock().iter().all(|(data, _)| data.is_some()));
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_attempt_count() {
    let client = QueryClient::new();
    let attempts = Arc::new(AtomicU32::new(0));

    let observer = QueryObserver::new(
        client.cache(),
        query_key!["flaky"],
        {
            let attempts = attempts.clone();
            move |_ctx: FetchContext| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err::<u32, _>(QueryError::FetchFailed("boom".to_string())) }
            }
        },
        QueryOptions::new()
            .with_enabled(false)
            .with_retry_count(2)
            .with_retry_delay(RetryDelay::Fixed(Duration::from_millis(250))),
    );
    observer.subscribe(|_| {});

    let result = observer.refetch().await;
    // retry = 2 means three total attempts before the error lands.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(result.is_error());
    assert_eq!(
        result.error,
        Some(QueryError::FetchFailed("boom".to_string()))
    );
    assert!(result.data.is_none());
}

#[tokio::test]
async fn test_failed_refetch_keeps_last_good_data() {
    let client = QueryClient::new();
    let fail = Arc::new(AtomicU32::new(0));

    let observer = QueryObserver::new(
        client.cache(),
        query_key!["account"],
        {
            let fail = fail.clone();
            move |_ctx: FetchContext| {
                let failing = fail.load(Ordering::SeqCst) == 1;
                async move {
                    if failing {
                        Err(QueryError::FetchFailed("offline".to_string()))
                    } else {
                        Ok(99u32)
                    }
                }
            }
        },
        QueryOptions::new().with_retry_count(0),
    );
    observer.subscribe(|_| {});
    wait_until(|| observer.result().is_success()).await;

    fail.store(1, Ordering::SeqCst);
    let result = observer.refetch().await;

    assert!(result.is_error());
    assert_eq!(result.data.as_deref().copied(), Some(99));
}

#[tokio::test]
async fn test_offline_fetch_pauses_and_resumes() {
    let client = QueryClient::new();
    client.online_manager().set_online(Some(false));

    let observer = QueryObserver::new(
        client.cache(),
        query_key!["paused"],
        |_ctx| async move { Ok(1u32) },
        QueryOptions::default(),
    );
    observer.subscribe(|_| {});

    wait_until(|| observer.result().fetch_status == FetchStatus::Paused).await;
    assert!(!observer.result().is_success());

    client.online_manager().set_online(Some(true));
    wait_until(|| observer.result().is_success()).await;
    assert_eq!(observer.data().as_deref().copied(), Some(1));
}

#[tokio::test]
async fn test_cancel_queries_keeps_query_remove_queries_drops_it() {
    let client = QueryClient::new();
    let started = Arc::new(AtomicU32::new(0));

    let observer = QueryObserver::new(
        client.cache(),
        query_key!["slow"],
        {
            let started = started.clone();
            move |ctx: FetchContext| {
                started.fetch_add(1, Ordering::SeqCst);
                async move {
                    // A fetch that cooperates with cancellation.
                    ctx.cancel.cancelled().await;
                    Err::<u32, _>(QueryError::Cancelled)
                }
            }
        },
        QueryOptions::default(),
    );
    observer.subscribe(|_| {});
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;

    client.cancel_queries(&QueryFilter::prefix(query_key!["slow"]));
    wait_until(|| !observer.result().is_fetching()).await;
    assert_eq!(client.cache().len(), 1, "cancel keeps the query around");

    client.remove_queries(&QueryFilter::prefix(query_key!["slow"]));
    assert_eq!(client.cache().len(), 0);
}

#[tokio::test]
async fn test_is_fetching_counts_in_flight_queries() {
    let client = QueryClient::new();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Arc::new(Mutex::new(Some(release_rx)));

    let observer = QueryObserver::new(
        client.cache(),
        query_key!["gated"],
        {
            let release_rx = release_rx.clone();
            move |_ctx: FetchContext| {
                let gate = release_rx.lock().take();
                async move {
                    if let Some(rx) = gate {
                        let _ = rx.await;
                    }
                    Ok(5u32)
                }
            }
        },
        QueryOptions::default(),
    );

    assert_eq!(client.is_fetching(&QueryFilter::all()), 0);
    observer.subscribe(|_| {});
    wait_until(|| client.is_fetching(&QueryFilter::all()) == 1).await;

    release_tx.send(()).expect("fetch should be waiting");
    wait_until(|| client.is_fetching(&QueryFilter::all()) == 0).await;
    assert_eq!(observer.data().as_deref().copied(), Some(5));
}
