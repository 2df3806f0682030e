// Integration tests for the write side: optimistic updates with rollback,
// cache updates from mutation responses, and invalidation from mutation
// callbacks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use requery::prelude::*;
use tokio::time::timeout;

type Todos = Vec<String>;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition should hold within the timeout");
}

fn todos_of(client: &QueryClient) -> Option<Todos> {
    client
        .get_query_data::<Todos>(&query_key!["todos"])
        .map(|todos| (*todos).clone())
}

/// An optimistic mutation against the `todos` query: snapshot in the
/// pre-mutation hook, speculative write, rollback from the snapshot on
/// error.
fn optimistic_mutation(
    client: &QueryClient,
    gate: tokio::sync::oneshot::Receiver<()>,
) -> Mutation<String, String, Option<Arc<Todos>>> {
    let gate = Arc::new(Mutex::new(Some(gate)));

    Mutation::with_context(
        client.mutations(),
        move |_todo: String| {
            let gate = gate.lock().take();
            async move {
                if let Some(rx) = gate {
                    let _ = rx.await;
                }
                Err(QueryError::FetchFailed("500".to_string()))
            }
        },
        {
            let client = client.clone();
            move |new_todo: &String| {
                // Cancel outgoing refetches so they don't overwrite the
                // optimistic write, then snapshot the previous value.
                client.cancel_queries(&QueryFilter::exact(query_key!["todos"]));
                let previous = client.get_query_data::<Todos>(&query_key!["todos"]);

                let new_todo = new_todo.clone();
                client.update_query_data::<Todos, _>(&query_key!["todos"], move |old| {
                    let mut next = old.map(|todos| (*todos).clone()).unwrap_or_default();
                    next.push(new_todo);
                    Some(next)
                });

                previous
            }
        },
    )
    .with_on_error({
        let client = client.clone();
        move |_error, _todo, previous| {
            // Roll back to the snapshot taken before the mutation.
            if let Some(previous) = previous {
                client.set_query_data(&query_key!["todos"], (**previous).clone());
            }
        }
    })
}

#[tokio::test]
async fn test_optimistic_update_visible_then_rolled_back() {
    let client = QueryClient::new();
    client.set_query_data(&query_key!["todos"], vec!["first".to_string()]);

    let (release_tx, release_rx) = tokio::sync::oneshot::channel();
    let mutation = optimistic_mutation(&client, release_rx);

    // The pre-mutation hook runs synchronously: the speculative value is
    // in the cache by the time `mutate` returns.
    mutation.mutate("second".to_string());
    assert_eq!(
        todos_of(&client),
        Some(vec!["first".to_string(), "second".to_string()])
    );

    // The server rejects the write: the snapshot is restored exactly.
    release_tx.send(()).expect("mutation should be waiting");
    wait_until(|| todos_of(&client) == Some(vec!["first".to_string()])).await;
    wait_until(|| mutation.status() == MutationStatus::Error).await;
}

#[tokio::test]
async fn test_mutate_async_propagates_error_after_rollback() {
    let client = QueryClient::new();
    client.set_query_data(&query_key!["todos"], vec!["only".to_string()]);

    let (release_tx, release_rx) = tokio::sync::oneshot::channel();
    drop(release_tx);
    let mutation = optimistic_mutation(&client, release_rx);

    let result = mutation.mutate_async("doomed".to_string()).await;
    assert_eq!(result, Err(QueryError::FetchFailed("500".to_string())));
    assert_eq!(todos_of(&client), Some(vec!["only".to_string()]));
}

#[tokio::test]
async fn test_mutation_response_updates_cache_directly() {
    let client = QueryClient::new();
    let key = query_key!["todo", 5];

    let mutation = Mutation::new(client.mutations(), |title: String| async move {
        Ok(title.to_uppercase())
    })
    .with_on_success({
        let client = client.clone();
        let key = key.clone();
        move |data: &String, _vars, _ctx| {
            // Write the server response straight into the query, saving a
            // refetch.
            client.set_query_data(&key, data.clone());
        }
    });

    mutation
        .mutate_async("new title".to_string())
        .await
        .expect("mutation should succeed");

    assert_eq!(
        client.get_query_data::<String>(&key).as_deref(),
        Some(&"NEW TITLE".to_string())
    );
}

#[tokio::test]
async fn test_settled_mutation_invalidates_and_refetches_query() {
    let client = QueryClient::new();
    let fetches = Arc::new(AtomicU32::new(0));

    let observer = QueryObserver::new(
        client.cache(),
        query_key!["todos"],
        {
            let fetches = fetches.clone();
            move |_ctx: FetchContext| {
                let n = fetches.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(vec![format!("server-{n}")]) }
            }
        },
        QueryOptions::new().with_stale_time(StaleTime::Never),
    );
    observer.subscribe(|_| {});
    wait_until(|| fetches.load(Ordering::SeqCst) == 1).await;

    let mutation = Mutation::new(client.mutations(), |todo: String| async move { Ok(todo) })
        .with_on_settled({
            let client = client.clone();
            move |_data, _error, _vars, _ctx| {
                // Always refetch after error or success.
                client.invalidate_queries(&QueryFilter::exact(query_key!["todos"]));
            }
        });

    mutation
        .mutate_async("added".to_string())
        .await
        .expect("mutation should succeed");

    wait_until(|| fetches.load(Ordering::SeqCst) == 2).await;
    wait_until(|| observer.data().as_deref() == Some(&vec!["server-2".to_string()])).await;
}

#[tokio::test]
async fn test_two_identical_mutations_stay_independent() {
    let client = QueryClient::new();
    let mutation = Mutation::new(client.mutations(), |n: u32| async move { Ok(n) })
        .with_key(query_key!["post"]);

    mutation.mutate_async(7).await.expect("should succeed");
    mutation.mutate_async(7).await.expect("should succeed");

    let records = client.mutations().records();
    assert_eq!(records.len(), 2);
    assert_eq!(client.is_mutating(&MutationFilter::all()), 0);

    // Both runs are introspectable with the variable-inspecting predicate.
    let with_seven = MutationFilter::prefix(query_key!["post"])
        .with_predicate(|record| record.variables::<u32>().as_deref() == Some(&7));
    let matching = records
        .iter()
        .filter(|record| record.variables::<u32>().as_deref() == Some(&7))
        .count();
    assert_eq!(matching, 2);
    assert_eq!(client.is_mutating(&with_seven), 0, "both runs have settled");
}
