//! DuckDB durable event store.
//!
//! The second storage level: holds the complete event history and answers
//! every query the cache cannot. Unlike the cache it never reports a range as
//! missing; sensors without data simply contribute no events.
//!
//! Range results are read page by page while they are being streamed, so a
//! long history is never materialized in memory at once.
//!
//! ```toml
//! [store]
//! engine = "duckdb"
//! connection = "events.duckdb"
//! options = { threads = "4" }
//! ```

use crate::batch::{BatchSender, BatchStreamer};
use crate::event::Event;
use crate::keys::{row_key, CacheEntry};
use crate::query::QuerySpec;
use crate::storage::table::{RowCursor, SharedTable};
use crate::storage::{Lifecycle, PersistSummary, ServiceState, StorageService};
use async_trait::async_trait;
use futures::{stream, Stream, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tonic::Status;
use tracing::{debug, info, warn};

const TABLE: &str = "events";

#[derive(Clone)]
pub struct DuckDbStore {
    connection: String,
    options: HashMap<String, String>,
    table: SharedTable,
    lifecycle: Arc<Lifecycle>,
    streamer: BatchStreamer,
}

impl DuckDbStore {
    pub fn new(connection: String, options: HashMap<String, String>, streamer: BatchStreamer) -> Self {
        Self {
            connection,
            options,
            table: SharedTable::default(),
            lifecycle: Arc::new(Lifecycle::default()),
            streamer,
        }
    }

    pub fn new_in_memory() -> Self {
        Self::new(":memory:".to_string(), HashMap::new(), BatchStreamer::default())
    }

    /// Lazily paged range read of one sensor.
    fn range_events(
        &self,
        sid: String,
        since: i64,
        until: i64,
    ) -> impl Stream<Item = Result<Event, Status>> + Send + 'static {
        let table = self.table.clone();
        let page_size = self.streamer.batch_size();
        let pages = stream::try_unfold(Some(None::<RowCursor>), move |cursor| {
            let table = table.clone();
            let sid = sid.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok::<_, Status>(None);
                };
                let (events, last) = table
                    .with(move |table| table.range_page(&sid, since, until, after, page_size))
                    .await?;
                if events.is_empty() {
                    return Ok(None);
                }
                let next = if events.len() < page_size { None } else { last.map(Some) };
                Ok(Some((events, next)))
            }
        });
        pages
            .map_ok(|events| stream::iter(events.into_iter().map(Ok::<Event, Status>)))
            .try_flatten()
    }

    async fn stream_query(self, spec: QuerySpec, sink: BatchSender) {
        let sids = spec.sids().to_vec();
        let last = sids.len().saturating_sub(1);
        for (index, sid) in sids.into_iter().enumerate() {
            let suppress_final = index < last;
            let result = match spec.time_range() {
                Some(range) => {
                    let events = self.range_events(sid.clone(), row_key(&range.since), row_key(&range.until));
                    self.streamer.stream_results(events, &sink, suppress_final).await
                }
                None => {
                    let key = sid.clone();
                    match self.table.with(move |table| table.latest(&key)).await {
                        Ok(latest) => {
                            let events = stream::iter(latest.into_iter().map(Ok));
                            self.streamer.stream_results(events, &sink, suppress_final).await
                        }
                        Err(status) => {
                            sink.fail(status.clone());
                            Err(status)
                        }
                    }
                }
            };
            if let Err(status) = result {
                warn!(channel = %sink.channel_id(), %sid, error = %status, "durable result stream ended early");
                return;
            }
            debug!(channel = %sink.channel_id(), %sid, "durable result streamed");
        }
    }
}

#[async_trait]
impl StorageService for DuckDbStore {
    fn kind(&self) -> &'static str {
        "duckdb-store"
    }

    async fn start(&self) -> Result<(), Status> {
        self.lifecycle
            .transition(ServiceState::Stopped, ServiceState::Starting)?;
        match self
            .table
            .open(self.connection.clone(), TABLE, self.options.clone())
            .await
        {
            Ok(()) => {
                self.lifecycle
                    .transition(ServiceState::Starting, ServiceState::Running)?;
                info!("durable event store started");
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
        info!("durable event store stopped");
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
                    warn!(sid = %event.sid(), error = %status, "event not stored");
                    failed += 1;
                    None
                }
            })
            .collect();
        let (persisted, rejected) = self.table.with(move |table| table.upsert_batch(&entries)).await?;
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
        tokio::spawn(self.clone().stream_query(spec.clone(), sink));
        Ok(())
    }
}
