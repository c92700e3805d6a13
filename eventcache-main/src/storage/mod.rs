//! Storage services for sensor events.
//!
//! This module provides the storage implementations used by the persistence
//! tier:
//! - `duckdb`: bounded first-level cache on an embedded DuckDB database
//! - `null`: disabled cache that accepts writes and refuses queries
//! - `durable`: DuckDB-backed durable second-level store
//! - `cached`: query router consulting the cache before the durable store
//!
//! Every implementation follows the [`StorageService`] contract. Backends are
//! picked by engine name through [`open_cache`] and [`open_store`].

pub mod cache;
pub mod cached;
pub mod duckdb;
pub mod durable;
pub mod null;
pub mod table;

use crate::batch::{BatchSender, BatchStreamer};
use crate::config::{CacheConfig, StoreConfig, StreamingConfig};
use crate::event::Event;
use crate::query::QuerySpec;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tonic::Status;

pub use self::cached::QueryRouter;
pub use self::duckdb::DuckDbCache;
pub use self::durable::DuckDbStore;
pub use self::null::NullCache;

/// Outcome of a persist call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    /// Events written or updated in place.
    pub persisted: usize,
    /// Events skipped because they could not be keyed or written.
    pub failed: usize,
}

/// Storage contract shared by caches and durable stores.
///
/// `persist` and `query` are only valid between a successful `start` and the
/// next `stop`.
#[async_trait]
pub trait StorageService: Send + Sync + 'static {
    /// Short engine name used in logs.
    fn kind(&self) -> &'static str;

    /// Acquires the backing resources.
    async fn start(&self) -> Result<(), Status>;

    /// Releases the backing resources.
    async fn stop(&self) -> Result<(), Status>;

    /// Writes a batch of events.
    ///
    /// Failures of single events are counted in the summary. An `Err` means
    /// the batch as a whole could not be written.
    async fn persist(&self, events: Vec<Event>) -> Result<PersistSummary, Status>;

    /// Starts answering `spec` on `sink`.
    ///
    /// `Ok` means streaming has begun; the result then arrives on the
    /// channel and ends with a final batch or a failure frame. `Err` means
    /// nothing was or will be sent.
    async fn query(&self, spec: &QuerySpec, sink: BatchSender) -> Result<(), Status>;
}

/// Answer of a cache that does not hold the requested data.
pub fn range_not_cached() -> Status {
    Status::not_found("Range not cached")
}

/// Answer of a storage service that does not support queries.
pub fn unsupported_operation() -> Status {
    Status::unimplemented("Unsupported operation")
}

/// Lifecycle of a storage service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Atomic `stopped -> starting -> running -> stopping -> stopped` cycle.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(ServiceState::Stopped as u8),
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`, failing if the service is elsewhere.
    pub fn transition(&self, from: ServiceState, to: ServiceState) -> Result<(), Status> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                Status::failed_precondition(format!(
                    "cannot move from {:?} to {:?} while {:?}",
                    from,
                    to,
                    ServiceState::from_u8(actual)
                ))
            })
    }

    /// Unconditionally records `state`; used to roll back a failed start.
    pub fn reset(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn ensure_running(&self) -> Result<(), Status> {
        match self.state() {
            ServiceState::Running => Ok(()),
            other => Err(Status::failed_precondition(format!(
                "storage service is {other:?}, not running"
            ))),
        }
    }
}

/// Builds the first-level cache selected by `config`.
///
/// A disabled cache, or engine `"null"`, yields a [`NullCache`].
pub fn open_cache(
    config: &CacheConfig,
    streaming: &StreamingConfig,
) -> Result<Arc<dyn StorageService>, Status> {
    if !config.enabled {
        return Ok(Arc::new(NullCache::new()));
    }
    match config.engine.as_str() {
        "duckdb" => Ok(Arc::new(DuckDbCache::new(
            config.connection.clone(),
            config.max_cached_events_per_sid,
            config.cleanup_interval(),
            BatchStreamer::from(streaming),
        ))),
        "null" => Ok(Arc::new(NullCache::new())),
        other => Err(Status::invalid_argument(format!(
            "unsupported cache engine: {other}"
        ))),
    }
}

/// Builds the durable store selected by `config`.
pub fn open_store(
    config: &StoreConfig,
    streaming: &StreamingConfig,
) -> Result<Arc<dyn StorageService>, Status> {
    match config.engine.as_str() {
        "duckdb" => Ok(Arc::new(DuckDbStore::new(
            config.connection.clone(),
            config.options.clone(),
            BatchStreamer::from(streaming),
        ))),
        other => Err(Status::invalid_argument(format!(
            "unsupported store engine: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_cycle() {
        let lifecycle = Lifecycle::default();
        assert!(lifecycle.ensure_running().is_err());
        lifecycle.transition(ServiceState::Stopped, ServiceState::Starting).unwrap();
        assert!(lifecycle.transition(ServiceState::Stopped, ServiceState::Starting).is_err());
        lifecycle.transition(ServiceState::Starting, ServiceState::Running).unwrap();
        assert!(lifecycle.ensure_running().is_ok());
        lifecycle.transition(ServiceState::Running, ServiceState::Stopping).unwrap();
        lifecycle.transition(ServiceState::Stopping, ServiceState::Stopped).unwrap();
        assert_eq!(lifecycle.state(), ServiceState::Stopped);
    }

    #[test]
    fn test_engine_selection() {
        let streaming = StreamingConfig::default();
        let mut cache = CacheConfig::default();
        assert_eq!(open_cache(&cache, &streaming).unwrap().kind(), "duckdb-cache");
        cache.enabled = false;
        assert_eq!(open_cache(&cache, &streaming).unwrap().kind(), "null");
        cache.enabled = true;
        cache.engine = "redis".into();
        assert!(open_cache(&cache, &streaming).is_err());

        let store = StoreConfig::default();
        assert_eq!(open_store(&store, &streaming).unwrap().kind(), "duckdb-store");
    }
}
