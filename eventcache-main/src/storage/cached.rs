//! Cache-first query routing.
//!
//! Every query is first offered to the first-level cache. When the cache
//! cannot answer it (range not cached, cache disabled, cache failure) the
//! identical query and result channel are handed to the durable store:
//!
//! ```text
//! query ──► cache.query ──ok──► result streams from the cache
//!                │
//!              error
//!                ▼
//!          store.query ──► result streams from the durable store
//! ```
//!
//! A cache that refuses a query never sends anything on the channel, so the
//! consumer sees exactly one result from exactly one source.
//!
//! # Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! engine = "duckdb"
//! connection = ":memory:"
//!
//! [store]
//! engine = "duckdb"
//! connection = "events.duckdb"
//! ```

use crate::batch::BatchSender;
use crate::query::QuerySpec;
use crate::storage::StorageService;
use std::sync::Arc;
use tonic::{Code, Status};
use tracing::{debug, info, warn};

/// Routes queries to the cache and falls back to the durable store.
pub struct QueryRouter {
    /// First-level cache
    cache: Arc<dyn StorageService>,
    /// Durable second-level store
    store: Arc<dyn StorageService>,
}

impl QueryRouter {
    pub fn new(cache: Arc<dyn StorageService>, store: Arc<dyn StorageService>) -> Self {
        Self { cache, store }
    }

    /// Answers `spec` on `sink` from the cache if possible, otherwise from
    /// the durable store.
    ///
    /// `Ok` means one of the two started streaming; the error of the durable
    /// store is returned if neither could.
    pub async fn query(&self, spec: &QuerySpec, sink: BatchSender) -> Result<(), Status> {
        match self.cache.query(spec, sink.clone()).await {
            Ok(()) => {
                debug!(channel = %sink.channel_id(), source = self.cache.kind(), "query served");
                Ok(())
            }
            Err(status) => {
                match status.code() {
                    Code::NotFound | Code::Unimplemented => info!(
                        channel = %sink.channel_id(),
                        reason = %status.message(),
                        "cache cannot answer query, using durable store"
                    ),
                    _ => warn!(
                        channel = %sink.channel_id(),
                        error = %status,
                        "cache query failed, using durable store"
                    ),
                }
                self.store.query(spec, sink).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::batch_channel;
    use crate::event::Event;
    use crate::storage::{DuckDbCache, DuckDbStore, NullCache};
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    fn event(sid: &str, at: DateTime<Utc>, value: i64) -> Event {
        Event::try_from(json!({"SID": sid, "timestamp": at.to_rfc3339(), "value": value})).unwrap()
    }

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn values(events: &[Event]) -> Vec<i64> {
        events.iter().map(|e| e.fields()["value"].as_i64().unwrap()).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_uncached_range_falls_back_to_store() {
        let cache = Arc::new(DuckDbCache::new_in_memory());
        let store = Arc::new(DuckDbStore::new_in_memory());
        cache.start().await.unwrap();
        store.start().await.unwrap();

        // The store has the full history, the cache only the recent part.
        let history: Vec<_> = (0..6).map(|i| event("a", base() + Duration::minutes(i), i)).collect();
        store.persist(history.clone()).await.unwrap();
        cache.persist(history[3..].to_vec()).await.unwrap();

        let router = QueryRouter::new(cache.clone(), store.clone());

        let (sender, receiver) = batch_channel("recent");
        let recent = QuerySpec::range(["a"], base() + Duration::minutes(4), base() + Duration::minutes(5));
        router.query(&recent, sender).await.unwrap();
        assert_eq!(values(&receiver.collect_events().await.unwrap()), vec![4, 5]);

        let (sender, receiver) = batch_channel("old");
        let old = QuerySpec::range(["a"], base(), base() + Duration::minutes(2));
        router.query(&old, sender).await.unwrap();
        assert_eq!(values(&receiver.collect_events().await.unwrap()), vec![0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disabled_cache_always_uses_store() {
        let store = Arc::new(DuckDbStore::new_in_memory());
        store.start().await.unwrap();
        store.persist(vec![event("a", base(), 1)]).await.unwrap();

        let router = QueryRouter::new(Arc::new(NullCache::new()), store);
        let (sender, receiver) = batch_channel("q");
        router.query(&QuerySpec::latest(["a"]), sender).await.unwrap();
        assert_eq!(values(&receiver.collect_events().await.unwrap()), vec![1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_store_error_is_returned() {
        let store = Arc::new(DuckDbStore::new_in_memory());
        let router = QueryRouter::new(Arc::new(NullCache::new()), store);
        let (sender, _receiver) = batch_channel("q");
        let status = router.query(&QuerySpec::latest(["a"]), sender).await.unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }
}
