//! DuckDB first-level cache.
//!
//! Keeps the most recent events of every sensor in an embedded DuckDB
//! database so recent ranges and latest values can be served without
//! touching the durable store. The implementation supports:
//! - In-memory and file-backed databases
//! - Idempotent writes keyed by event identity
//! - Periodic pruning to a fixed number of events per sensor
//! - "Fully cached" detection before answering a range query
//!
//! # Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! engine = "duckdb"
//! connection = ":memory:"
//! max_cached_events_per_sid = 100
//! cleanup_interval_secs = 60
//! ```
//!
//! Or via command line:
//!
//! ```bash
//! pulsestore \
//!   --enable-cache true \
//!   --cache-engine duckdb \
//!   --cache-connection ":memory:" \
//!   --cache-max-events-per-sid 100
//! ```
//!
//! A range query is answered only if the cache reaches back to `since` for
//! every requested sensor; otherwise it fails with "Range not cached" and
//! the caller falls back to the durable store.

use crate::batch::{BatchSender, BatchStreamer};
use crate::event::Event;
use crate::keys::{row_key, CacheEntry};
use crate::query::QuerySpec;
use crate::storage::cache::CleanupSchedule;
use crate::storage::table::SharedTable;
use crate::storage::{range_not_cached, Lifecycle, PersistSummary, ServiceState, StorageService};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::Status;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CACHED_EVENTS_PER_SID: usize = 100;

const TABLE: &str = "cache_events";

/// DuckDB-backed first-level cache.
#[derive(Clone)]
pub struct DuckDbCache {
    connection: String,
    table: SharedTable,
    lifecycle: Arc<Lifecycle>,
    cleanup: Arc<CleanupSchedule>,
    max_cached_events_per_sid: usize,
    streamer: BatchStreamer,
}

impl DuckDbCache {
    pub fn new(
        connection: String,
        max_cached_events_per_sid: usize,
        cleanup_interval: chrono::Duration,
        streamer: BatchStreamer,
    ) -> Self {
        Self::with_schedule(
            connection,
            max_cached_events_per_sid,
            CleanupSchedule::new(cleanup_interval),
            streamer,
        )
    }

    /// Cache with an explicit pruning schedule.
    pub fn with_schedule(
        connection: String,
        max_cached_events_per_sid: usize,
        cleanup: CleanupSchedule,
        streamer: BatchStreamer,
    ) -> Self {
        Self {
            connection,
            table: SharedTable::default(),
            lifecycle: Arc::new(Lifecycle::default()),
            cleanup: Arc::new(cleanup),
            max_cached_events_per_sid,
            streamer,
        }
    }

    /// Creates an in-memory cache with default limits.
    pub fn new_in_memory() -> Self {
        Self::new(
            ":memory:".to_string(),
            DEFAULT_MAX_CACHED_EVENTS_PER_SID,
            chrono::Duration::minutes(1),
            BatchStreamer::default(),
        )
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    /// Prunes every sensor down to its newest events.
    pub async fn cleanup(&self) -> Result<usize, Status> {
        let keep = self.max_cached_events_per_sid;
        self.table.with(move |table| table.retain_latest(keep)).await
    }

    /// Number of cached events of `sid`.
    pub async fn cached_count(&self, sid: &str) -> Result<usize, Status> {
        let sid = sid.to_string();
        self.table.with(move |table| table.count(&sid)).await
    }

    async fn query_latest(&self, sids: Vec<String>, sink: BatchSender) -> Result<(), Status> {
        let latest = self
            .table
            .with(move |table| {
                sids.iter()
                    .map(|sid| table.latest(sid))
                    .collect::<Result<Vec<Option<Event>>, Status>>()
            })
            .await?;
        let Some(events) = latest.into_iter().collect::<Option<Vec<Event>>>() else {
            return Err(range_not_cached());
        };

        let streamer = self.streamer;
        tokio::spawn(async move {
            let result = streamer
                .stream_results(stream::iter(events.into_iter().map(Ok)), &sink, false)
                .await;
            if let Err(status) = result {
                warn!(channel = %sink.channel_id(), error = %status, "latest snapshot stream ended early");
            }
        });
        Ok(())
    }

    async fn query_range(&self, spec: &QuerySpec, sink: BatchSender) -> Result<(), Status> {
        let Some(range) = spec.time_range().copied() else {
            return Err(Status::invalid_argument("range query without bounds"));
        };
        let since = row_key(&range.since);
        let until = row_key(&range.until);

        // Coverage check and reads run under one lock; the streamed ranges
        // are exactly the rows the check accepted.
        let sids = spec.sids().to_vec();
        let snapshot = self
            .table
            .with(move |table| {
                for sid in &sids {
                    match table.oldest_row_key(sid)? {
                        Some(oldest) if oldest <= since => {}
                        _ => return Ok(None),
                    }
                }
                sids.into_iter()
                    .map(|sid| {
                        let events = table.range(&sid, since, until)?;
                        Ok((sid, events))
                    })
                    .collect::<Result<Vec<(String, Vec<Event>)>, Status>>()
                    .map(Some)
            })
            .await?;
        let Some(snapshot) = snapshot else {
            return Err(range_not_cached());
        };

        let streamer = self.streamer;
        tokio::spawn(async move {
            let last = snapshot.len() - 1;
            for (index, (sid, events)) in snapshot.into_iter().enumerate() {
                debug!(%sid, count = events.len(), "streaming cached range");
                let result = streamer
                    .stream_results(stream::iter(events.into_iter().map(Ok)), &sink, index < last)
                    .await;
                if let Err(status) = result {
                    warn!(channel = %sink.channel_id(), %sid, error = %status, "cached range stream ended early");
                    return;
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl StorageService for DuckDbCache {
    fn kind(&self) -> &'static str {
        "duckdb-cache"
    }

    async fn start(&self) -> Result<(), Status> {
        self.lifecycle
            .transition(ServiceState::Stopped, ServiceState::Starting)?;
        match self
            .table
            .open(self.connection.clone(), TABLE, HashMap::new())
            .await
        {
            Ok(()) => {
                self.lifecycle
                    .transition(ServiceState::Starting, ServiceState::Running)?;
                info!(
                    max_cached_events_per_sid = self.max_cached_events_per_sid,
                    next_cleanup = %self.cleanup.next_due(),
                    "event cache started"
                );
                Ok(())
            }
            Err(status) => {
                self.lifecycle.reset(ServiceState::Stopped);
                Err(status)
            }
        }
    }

    async fn stop(&self) -> Result<(), Status> {
        self.lifecycle
            .transition(ServiceState::Running, ServiceState::Stopping)?;
        self.table.close().await;
        self.lifecycle
            .transition(ServiceState::Stopping, ServiceState::Stopped)?;
        info!("event cache stopped");
        Ok(())
    }

    async fn persist(&self, events: Vec<Event>) -> Result<PersistSummary, Status> {
        self.lifecycle.ensure_running()?;
        if events.is_empty() {
            return Ok(PersistSummary::default());
        }

        let mut failed = 0;
        let entries: Vec<CacheEntry> = events
            .iter()
            .filter_map(|event| match CacheEntry::from_event(event) {
                Ok(entry) => Some(entry),
                Err(status) => {
                    warn!(sid = %event.sid(), error = %status, "event not cached");
                    failed += 1;
                    None
                }
            })
            .collect();

        let cleanup = self.cleanup.clone();
        let keep = self.max_cached_events_per_sid;
        let (persisted, rejected) = self
            .table
            .with(move |table| {
                let written = table.upsert_batch(&entries)?;
                // Pruning shares the write lock but not the write transaction.
                if cleanup.try_claim(Utc::now()) {
                    match table.retain_latest(keep) {
                        Ok(deleted) => info!(deleted, keep, "cache cleanup finished"),
                        Err(status) => warn!(error = %status, "cache cleanup failed"),
                    }
                }
                Ok(written)
            })
            .await?;

        Ok(PersistSummary {
            persisted,
            failed: failed + rejected,
        })
    }

    async fn query(&self, spec: &QuerySpec, sink: BatchSender) -> Result<(), Status> {
        self.lifecycle.ensure_running()?;
        if spec.sids().is_empty() {
            let streamer = self.streamer;
            tokio::spawn(async move {
                if let Err(status) = streamer.stream_results(stream::empty::<Result<Event, Status>>(), &sink, false).await {
                    debug!(error = %status, "empty result not delivered");
                }
            });
            return Ok(());
        }
        match spec.time_range() {
            None => self.query_latest(spec.sids().to_vec(), sink).await,
            Some(_) => self.query_range(spec, sink).await,
        }
    }
}
