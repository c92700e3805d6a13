//! Event intake.
//!
//! The [`IntakeRouter`] validates incoming events, queues them per sensor for
//! the durable writer and mirrors every accepted batch into the first-level
//! cache. It is owned by a single task; other tasks talk to it through an
//! [`IntakeHandle`].

use crate::config::IntakeSettings;
use crate::queue_map::PriorityQueueMap;
use eventcache_core::{Event, StorageService};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tonic::Status;
use tracing::{debug, info, warn};

/// Outcome of one accepted batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeReport {
    pub received: usize,
    pub accepted: usize,
    pub rejected: usize,
}

/// Running totals since start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeStats {
    pub received: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub persist_failures: u64,
    /// Events currently waiting to be drained.
    pub queued: usize,
}

pub struct IntakeRouter {
    queues: PriorityQueueMap,
    cache: Arc<dyn StorageService>,
    stats: IntakeStats,
}

impl IntakeRouter {
    pub fn new(settings: &IntakeSettings, cache: Arc<dyn StorageService>) -> Self {
        Self::with_queues(
            PriorityQueueMap::new(
                settings.max_batch_size,
                Duration::from_millis(settings.max_time_millis),
            ),
            cache,
        )
    }

    pub fn with_queues(queues: PriorityQueueMap, cache: Arc<dyn StorageService>) -> Self {
        Self {
            queues,
            cache,
            stats: IntakeStats::default(),
        }
    }

    /// Queues every valid event and forwards the valid ones to the cache.
    ///
    /// Invalid events are dropped and counted. A cache failure is logged and
    /// does not undo the queueing.
    pub async fn accept(&mut self, events: Vec<Value>) -> IntakeReport {
        let received = events.len();
        let mut accepted = Vec::with_capacity(received);
        for value in events {
            match Event::try_from(value) {
                Ok(event) => {
                    self.queues.put(event.sid(), event.clone());
                    accepted.push(event);
                }
                Err(reason) => debug!(%reason, "event rejected"),
            }
        }

        let report = IntakeReport {
            received,
            accepted: accepted.len(),
            rejected: received - accepted.len(),
        };
        self.stats.received += report.received as u64;
        self.stats.accepted += report.accepted as u64;
        self.stats.rejected += report.rejected as u64;
        if report.rejected > 0 {
            warn!(rejected = report.rejected, received, "dropped invalid events");
        }

        if !accepted.is_empty() {
            match self.cache.persist(accepted).await {
                Ok(summary) if summary.failed > 0 => {
                    warn!(failed = summary.failed, persisted = summary.persisted, "events not cached");
                }
                Ok(_) => {}
                Err(status) => {
                    self.stats.persist_failures += 1;
                    warn!(cache = self.cache.kind(), error = %status, "cache persist failed");
                }
            }
        }
        report
    }

    /// Drains the most urgent sensor queue, or returns nothing if all are
    /// empty.
    pub fn drain_next(&mut self) -> Vec<Event> {
        let events = self.queues.drain_next();
        if !events.is_empty() {
            debug!(sid = %events[0].sid(), count = events.len(), "drained queue");
        }
        events
    }

    pub fn stats(&self) -> IntakeStats {
        IntakeStats {
            queued: self.queues.total_count(),
            ..self.stats
        }
    }

    /// Moves the router onto its own task.
    pub fn spawn(self, mailbox_capacity: usize) -> (IntakeHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
        let task = tokio::spawn(self.run(rx));
        (IntakeHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<IntakeCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                IntakeCommand::Accept { events, reply } => {
                    let report = self.accept(events).await;
                    let _ = reply.send(report);
                }
                IntakeCommand::Pull { reply } => {
                    let _ = reply.send(self.drain_next());
                }
                IntakeCommand::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                IntakeCommand::Shutdown { reply } => {
                    let _ = reply.send(self.stats());
                    break;
                }
            }
        }
        info!(stats = ?self.stats(), "intake stopped");
    }
}

enum IntakeCommand {
    Accept {
        events: Vec<Value>,
        reply: oneshot::Sender<IntakeReport>,
    },
    Pull {
        reply: oneshot::Sender<Vec<Event>>,
    },
    Stats {
        reply: oneshot::Sender<IntakeStats>,
    },
    Shutdown {
        reply: oneshot::Sender<IntakeStats>,
    },
}

/// Cloneable address of a running [`IntakeRouter`].
///
/// The router stops on [`IntakeHandle::shutdown`] or once every handle is
/// dropped. Events still queued at that point are discarded.
#[derive(Clone)]
pub struct IntakeHandle {
    tx: mpsc::Sender<IntakeCommand>,
}

impl IntakeHandle {
    pub async fn accept(&self, events: Vec<Value>) -> Result<IntakeReport, Status> {
        self.request(|reply| IntakeCommand::Accept { events, reply }).await
    }

    /// The pull endpoint: the next drained batch, possibly empty.
    pub async fn pull(&self) -> Result<Vec<Event>, Status> {
        self.request(|reply| IntakeCommand::Pull { reply }).await
    }

    pub async fn stats(&self) -> Result<IntakeStats, Status> {
        self.request(|reply| IntakeCommand::Stats { reply }).await
    }

    /// Stops the router and returns its final totals.
    pub async fn shutdown(&self) -> Result<IntakeStats, Status> {
        self.request(|reply| IntakeCommand::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> IntakeCommand,
    ) -> Result<T, Status> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| Status::unavailable("intake is not running"))?;
        response
            .await
            .map_err(|_| Status::internal("intake dropped the request"))
    }
}
