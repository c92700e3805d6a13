//! Durable writer.
//!
//! Pulls drained batches from the intake and writes them to the durable
//! store. When the intake has nothing to hand out, or a pull fails, the
//! worker sleeps for `pull_delay` before asking again.

use crate::intake::IntakeHandle;
use eventcache_core::StorageService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::Status;
use tracing::{debug, info, warn};

pub struct PullWorker {
    intake: IntakeHandle,
    store: Arc<dyn StorageService>,
    pull_delay: Duration,
}

impl PullWorker {
    pub fn new(intake: IntakeHandle, store: Arc<dyn StorageService>, pull_delay: Duration) -> Self {
        Self {
            intake,
            store,
            pull_delay,
        }
    }

    /// Pulls one batch and writes it. Returns the number of events pulled.
    pub async fn pull_once(&self) -> Result<usize, Status> {
        let events = self.intake.pull().await?;
        if events.is_empty() {
            return Ok(0);
        }
        let pulled = events.len();
        let sid = events[0].sid().to_string();
        match self.store.persist(events).await {
            Ok(summary) => {
                debug!(%sid, persisted = summary.persisted, failed = summary.failed, "batch stored");
                if summary.failed > 0 {
                    warn!(%sid, failed = summary.failed, "events not stored");
                }
            }
            Err(status) => {
                warn!(%sid, lost = pulled, store = self.store.kind(), error = %status, "durable persist failed");
            }
        }
        Ok(pulled)
    }

    /// Runs until `shutdown` turns true or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(pull_delay = ?self.pull_delay, "durable writer started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let idle = match self.pull_once().await {
                    Ok(pulled) => pulled == 0,
                    Err(status) => {
                        warn!(error = %status, "pull failed");
                        true
                    }
                };
                if idle {
                    tokio::select! {
                        _ = tokio::time::sleep(self.pull_delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            info!("durable writer stopped");
        })
    }
}
