//! # requery - Asynchronous Query Cache
//!
//! Requery is a client-side cache for asynchronous read and write
//! operations, built on [tokio](https://tokio.rs/). It manages query keys,
//! staleness, background refetch, retries with backoff, pagination,
//! mutations with optimistic rollback, and invalidation - the engine
//! behind the stale-while-revalidate pattern.
//!
//! ## Architecture
//!
//! Data flows through a small set of components:
//!
//! 1. **Key**: A structured [`QueryKey`](key::QueryKey) is hashed into the
//!    canonical cache identity
//! 2. **Cache**: The [`QueryCache`](cache::QueryCache) owns one
//!    [`Query`](query::Query) per key hash - the single source of truth
//! 3. **Observer**: A [`QueryObserver`](observer::QueryObserver) binds one
//!    consumer's options to a query and re-notifies it only when the
//!    derived result changes
//! 4. **Retryer**: Failed fetches retry with configurable backoff, pause
//!    while offline, and cancel cleanly
//! 5. **Mutations**: Write operations are tracked in an ordered
//!    [`MutationCache`](mutation::MutationCache) and can roll optimistic
//!    updates back on failure
//! 6. **Signals**: Focus and connectivity transitions trigger background
//!    refetch of eligible queries
//!
//! Concurrent fetches for one key are deduplicated: every caller attaches
//! to the same in-flight outcome. A query with no observers is
//! garbage-collected after its configured cache time.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use requery::prelude::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let client = QueryClient::new();
//!
//!     let todos = QueryObserver::new(
//!         client.cache(),
//!         query_key!["todos"],
//!         |_ctx| async move { Ok::<_, QueryError>(vec!["buy milk".to_string()]) },
//!         QueryOptions::new().with_stale_time(Duration::from_secs(30)),
//!     );
//!     todos.subscribe(|result| {
//!         if let Some(todos) = result.data {
//!             println!("{todos:?}");
//!         }
//!     });
//!
//!     // Later: a write landed somewhere else, refresh the list.
//!     client.invalidate_queries(&QueryFilter::prefix(query_key!["todos"]));
//! }
//! ```
//!
//! ## Design Notes
//!
//! There is no ambient global client: callers construct a
//! [`QueryClient`](client::QueryClient) and pass it explicitly. The engine
//! assumes a tokio runtime; fetches, retry timers, and garbage collection
//! run as spawned tasks that apply their results back through the cache.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod infinite;
pub mod key;
pub mod mutation;
pub mod observer;
pub mod prelude;
pub mod query;
pub mod retry;
pub mod signals;
pub mod snapshot;
