//! Snapshot boundary: export and import of cached query data.
//!
//! [`dehydrate`] produces a serializable, point-in-time snapshot of every
//! successful query that can cross the boundary; [`hydrate`] seeds a
//! freshly constructed cache from one, the process-boundary handoff.
//! Mutations are never part of a snapshot.
//!
//! Because cached data is type-erased, a query participates only if it
//! carries a [`DataCodec`] (attached with
//! [`QueryOptions::with_snapshot`](crate::config::QueryOptions::with_snapshot)).
//! Hydrated payloads are revived lazily: the raw JSON value sits in the
//! query until a typed observer with a codec decodes it, preserving the
//! snapshot's data timestamp for staleness.
//!
//! ```rust,ignore
//! // Process A
//! let snapshot = serde_json::to_string(&client.dehydrate())?;
//!
//! // Process B
//! let client = QueryClient::new();
//! client.hydrate(serde_json::from_str(&snapshot)?);
//! ```

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::QueryCache;
use crate::key::QueryKey;
use crate::query::{QueryData, QueryStatus};

/// Bridges a query's type-erased data to a JSON payload and back.
pub struct DataCodec {
    encode: Box<dyn Fn(&QueryData) -> Option<serde_json::Value> + Send + Sync>,
    decode: Box<dyn Fn(&serde_json::Value) -> Option<QueryData> + Send + Sync>,
}

impl DataCodec {
    /// The codec for a concrete data type.
    #[must_use]
    pub fn of<T>() -> Arc<Self>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Arc::new(Self {
            encode: Box::new(|data| {
                let typed = data.clone().downcast::<T>().ok()?;
                serde_json::to_value(&*typed).ok()
            }),
            decode: Box::new(|value| {
                let typed: T = serde_json::from_value(value.clone()).ok()?;
                Some(Arc::new(typed) as QueryData)
            }),
        })
    }

    pub(crate) fn encode(&self, data: &QueryData) -> Option<serde_json::Value> {
        (self.encode)(data)
    }

    pub(crate) fn decode(&self, value: &serde_json::Value) -> Option<QueryData> {
        (self.decode)(value)
    }
}

impl fmt::Debug for DataCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataCodec")
    }
}

/// One query's exported record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DehydratedQuery {
    /// The query's key.
    pub key: QueryKey,
    /// The query's status at export time; only successful queries are
    /// exported.
    pub status: QueryStatus,
    /// The JSON payload produced by the query's codec.
    pub data: serde_json::Value,
    /// Wall-clock milliseconds when the data landed, preserved across the
    /// boundary for staleness.
    pub data_updated_at_ms: u64,
}

/// A serializable snapshot of a cache's successful queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DehydratedState {
    /// The exported query records.
    pub queries: Vec<DehydratedQuery>,
}

/// Exports every successful query carrying a codec (or still holding a raw
/// hydrated payload).
pub(crate) fn dehydrate(cache: &QueryCache) -> DehydratedState {
    let mut queries = Vec::new();
    for query in cache.queries() {
        let state = query.state();
        if state.status != QueryStatus::Success {
            continue;
        }
        let (Some(data), Some(wall_ms)) = (state.data, state.data_updated_wall_ms) else {
            continue;
        };

        // A payload that was hydrated and never revived is already JSON.
        let value = if state.data_is_hydrated {
            data.downcast::<serde_json::Value>()
                .ok()
                .map(|value| (*value).clone())
        } else {
            query.codec().and_then(|codec| codec.encode(&data))
        };
        let Some(value) = value else { continue };

        queries.push(DehydratedQuery {
            key: query.key().clone(),
            status: state.status,
            data: value,
            data_updated_at_ms: wall_ms,
        });
    }
    debug!(queries = queries.len(), "dehydrated cache");
    DehydratedState { queries }
}

/// Seeds `cache` from a snapshot.
///
/// Entries whose key already holds data at least as new as the snapshot
/// are left untouched.
pub(crate) fn hydrate(cache: &QueryCache, snapshot: DehydratedState) {
    for entry in snapshot.queries {
        let query = cache.get_or_create(entry.key, cache.defaults());
        let state = query.state();
        let existing_ms = state.data_updated_wall_ms.unwrap_or(0);
        if state.data.is_some() && existing_ms >= entry.data_updated_at_ms {
            continue;
        }
        query.seed_hydrated(
            Arc::new(entry.data) as QueryData,
            entry.data_updated_at_ms,
        );
    }
}
