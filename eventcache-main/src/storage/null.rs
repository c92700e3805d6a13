//! Disabled first-level cache.

use crate::batch::BatchSender;
use crate::event::Event;
use crate::query::QuerySpec;
use crate::storage::{unsupported_operation, PersistSummary, StorageService};
use async_trait::async_trait;
use tonic::Status;
use tracing::{trace, warn};

/// Cache stand-in used when caching is switched off.
///
/// Accepts and discards every write and refuses every query, so the query
/// router always falls through to the durable store.
#[derive(Debug)]
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        warn!("first-level cache is disabled; every query is served by the durable store");
        Self
    }
}

impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageService for NullCache {
    fn kind(&self) -> &'static str {
        "null"
    }

    async fn start(&self) -> Result<(), Status> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), Status> {
        Ok(())
    }

    async fn persist(&self, events: Vec<Event>) -> Result<PersistSummary, Status> {
        trace!(discarded = events.len(), "null cache discarded events");
        Ok(PersistSummary::default())
    }

    async fn query(&self, _spec: &QuerySpec, _sink: BatchSender) -> Result<(), Status> {
        Err(unsupported_operation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::batch_channel;
    use serde_json::json;

    #[tokio::test]
    async fn test_query_is_unsupported_and_silent() {
        let cache = NullCache::new();
        cache.start().await.unwrap();
        let (sender, mut receiver) = batch_channel("q");
        let status = cache.query(&QuerySpec::latest(["a"]), sender).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
        assert_eq!(status.message(), "Unsupported operation");
        // The sink was dropped without a single frame.
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_persist_discards() {
        let cache = NullCache::new();
        let event = Event::try_from(json!({"SID": "a", "timestamp": "2024-01-01T00:00:00Z"})).unwrap();
        assert_eq!(cache.persist(vec![event]).await.unwrap(), PersistSummary::default());
        cache.stop().await.unwrap();
    }
}
