//! Prelude module for convenient imports.
//!
//! ```
//! use requery::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The engine handle: caches, signals, defaults
//! - [`QueryObserver`] / [`QueryObserverResult`] - Typed subscriptions
//! - [`InfiniteQueryObserver`] - Paginated queries
//! - [`Mutation`] - Tracked write operations
//! - [`QueryOptions`] / [`StaleTime`] - Per-query configuration
//! - [`QueryFilter`] / [`MutationFilter`] - Bulk-operation selectors
//! - [`QueryError`] - The shared error type
//! - [`query_key!`](crate::query_key) - Key construction macro

pub use crate::cache::{QueryCache, QueryFilter};
pub use crate::client::QueryClient;
pub use crate::config::{QueryOptions, RetryDelay, RetryPolicy, StaleTime};
pub use crate::error::QueryError;
pub use crate::infinite::{InfiniteData, InfiniteQueryObserver};
pub use crate::key::{KeySegment, QueryKey};
pub use crate::mutation::{Mutation, MutationCache, MutationFilter, MutationStatus};
pub use crate::observer::{QueryObserver, QueryObserverResult};
pub use crate::query::{FetchContext, FetchStatus, QueryStatus};
pub use crate::query_key;
pub use crate::signals::{FocusManager, OnlineManager};
pub use crate::snapshot::DehydratedState;
