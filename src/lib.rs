//! Pulsestore: intake and write-behind for sensor events
//!
//! This library accepts batches of sensor events, queues them per sensor and
//! mirrors them into a first-level cache right away. A durable writer pulls
//! the queues in priority order (stale sensors first, then overflowing ones,
//! then the longest waiting) and writes them to the durable store.
//! Storage and querying live in the `eventcache` crate.
//!
//! # Example
//!
//! ```rust,no_run
//! use eventcache_core::config::Settings;
//! use eventcache_core::storage::{open_cache, open_store};
//! use pulsestore::{IntakeRouter, PullWorker, ServiceSettings};
//! use serde_json::json;
//! use std::time::Duration;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Settings::default();
//!     let service = ServiceSettings::new()?;
//!
//!     let cache = open_cache(&storage.cache, &storage.streaming)?;
//!     let store = open_store(&storage.store, &storage.streaming)?;
//!     cache.start().await?;
//!     store.start().await?;
//!
//!     // Queue and cache incoming events
//!     let (intake, _task) = IntakeRouter::new(&service.intake, cache).spawn(1024);
//!     let report = intake
//!         .accept(vec![json!({"SID": "sensor-1", "timestamp": "2024-03-01T12:00:00Z", "v": 1})])
//!         .await?;
//!     println!("accepted {} of {}", report.accepted, report.received);
//!
//!     // Drain into the durable store until told to stop
//!     let (stop, stopped) = watch::channel(false);
//!     let writer = PullWorker::new(intake, store, Duration::from_millis(100)).spawn(stopped);
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     stop.send(true)?;
//!     writer.await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod intake;
pub mod pull;
pub mod queue_map;
pub mod tests;

pub use config::ServiceSettings;
pub use intake::{IntakeHandle, IntakeReport, IntakeRouter, IntakeStats};
pub use pull::PullWorker;
pub use queue_map::PriorityQueueMap;
