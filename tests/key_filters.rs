// Integration tests for key identity and filter semantics across cache
// operations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use requery::prelude::*;
use tokio::time::timeout;

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
async fn test_preview_variant_is_a_distinct_query() {
    let client = QueryClient::new();
    let plain = query_key!["todo", 5];
    let preview = query_key!["todo", 5, KeySegment::map([("preview", true)])];

    assert_ne!(plain.hash_key(), preview.hash_key());

    client.set_query_data(&plain, "plain".to_string());
    client.set_query_data(&preview, "preview".to_string());
    assert_eq!(client.cache().len(), 2);

    // An exact filter touches only its own entry.
    client.remove_queries(&QueryFilter::exact(plain.clone()));
    assert_eq!(client.cache().len(), 1);
    assert!(client.get_query_data::<String>(&plain).is_none());
    assert_eq!(
        client.get_query_data::<String>(&preview).as_deref(),
        Some(&"preview".to_string())
    );
}

#[tokio::test]
async fn test_prefix_filter_matches_both_variants() {
    let client = QueryClient::new();
    client.set_query_data(&query_key!["todo", 5], 1u32);
    client.set_query_data(
        &query_key!["todo", 5, KeySegment::map([("preview", true)])],
        2u32,
    );
    client.set_query_data(&query_key!["user"], 3u32);

    client.remove_queries(&QueryFilter::prefix(query_key!["todo"]));
    assert_eq!(client.cache().len(), 1);
    assert!(client.get_query_data::<u32>(&query_key!["user"]).is_some());
}

#[tokio::test]
async fn test_mapping_key_order_is_one_cache_entry() {
    let client = QueryClient::new();
    let a = query_key![
        "todos",
        KeySegment::map([("status", KeySegment::from("done")), ("page", KeySegment::from(1))])
    ];
    let b = query_key![
        "todos",
        KeySegment::map([("page", KeySegment::from(1)), ("status", KeySegment::from("done"))])
    ];

    client.set_query_data(&a, "first".to_string());
    client.set_query_data(&b, "second".to_string());

    assert_eq!(client.cache().len(), 1);
    assert_eq!(
        client.get_query_data::<String>(&a).as_deref(),
        Some(&"second".to_string())
    );
}

#[tokio::test]
async fn test_remove_inactive_only_spares_observed_queries() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    // An actively observed posts query and an inactive one.
    let observer = QueryObserver::new(
        client.cache(),
        query_key!["posts", "list"],
        {
            let calls = calls.clone();
            move |_ctx: FetchContext| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(1u32) }
            }
        },
        QueryOptions::default(),
    );
    observer.subscribe(|_| {});
    wait_until(|| observer.result().is_success()).await;
    client.set_query_data(&query_key!["posts", "archive"], 2u32);

    // Remove all inactive queries that begin with `posts` in the key.
    client.remove_queries(&QueryFilter::prefix(query_key!["posts"]).inactive_only());

    assert_eq!(client.cache().len(), 1);
    assert!(client
        .get_query_data::<u32>(&query_key!["posts", "list"])
        .is_some());
}

#[tokio::test]
async fn test_refetch_active_only() {
    let client = QueryClient::new();
    let active_calls = Arc::new(AtomicU32::new(0));

    let observer = QueryObserver::new(
        client.cache(),
        query_key!["posts", "list"],
        {
            let calls = active_calls.clone();
            move |_ctx: FetchContext| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(1u32) }
            }
        },
        QueryOptions::new().with_stale_time(StaleTime::Never),
    );
    observer.subscribe(|_| {});
    wait_until(|| active_calls.load(Ordering::SeqCst) == 1).await;

    // This entry has no observers and no fetch function on record.
    client.set_query_data(&query_key!["posts", "archive"], 2u32);

    client
        .refetch_queries(&QueryFilter::all().active_only())
        .await;
    assert_eq!(active_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidate_prefix_marks_unobserved_without_fetching() {
    let client = QueryClient::new();
    client.set_query_data(&query_key!["todos", 1], 1u32);
    client.set_query_data(&query_key!["todos", 2], 2u32);

    client.invalidate_queries(&QueryFilter::prefix(query_key!["todos"]));

    for query in client.cache().queries() {
        assert!(query.state().is_invalidated);
        assert!(query.is_stale(StaleTime::Never), "invalidation beats any window");
    }
    assert_eq!(client.is_fetching(&QueryFilter::all()), 0);
}

#[tokio::test]
async fn test_predicate_filter_over_query_state() {
    let client = QueryClient::new();
    client.set_query_data(&query_key!["a"], 1u32);
    client.set_query_data(&query_key!["b"], 2u32);

    // Invalidate only queries currently holding the value 2.
    client.invalidate_queries(&QueryFilter::all().with_predicate(|query| {
        query
            .state()
            .data
            .and_then(|data| data.downcast::<u32>().ok())
            .as_deref()
            == Some(&2)
    }));

    let a = client.cache().get(&query_key!["a"]).expect("query a");
    let b = client.cache().get(&query_key!["b"]).expect("query b");
    assert!(!a.state().is_invalidated);
    assert!(b.state().is_invalidated);
}
