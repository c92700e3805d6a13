//! Pulsestore binary.
//!
//! Runs the persistence tier in one process: events read from standard input
//! are validated, queued per sensor, mirrored into the first-level cache and
//! drained into the durable store. Once input ends the remaining queues are
//! flushed and, if requested, one query is answered on standard output.
//!
//! # Input
//!
//! One JSON value per line: either a single event object or an array of
//! events. Every event needs a string `SID` and an RFC 3339 `timestamp`.
//!
//! ```text
//! {"SID": "sensor-1", "timestamp": "2024-03-01T12:00:00Z", "temperature": 21.5}
//! [{"SID": "sensor-2", "timestamp": "2024-03-01T12:00:01Z", "humidity": 40}]
//! ```
//!
//! # Configuration
//!
//! Storage settings come from the `eventcache` configuration chain (embedded
//! defaults, `/etc/eventcache/config.toml`, `--config`, `EVENTCACHE__*`
//! variables, flags). Intake settings come from `config/default.toml`,
//! `config/local.toml` and `PULSESTORE__*` variables.
//!
//! ## Command-line Options
//!
//! ```text
//! Options:
//!   -c, --config <FILE>                    Storage configuration file
//!       --enable-cache <BOOL>              Enable the first-level cache [env: EVENTCACHE_ENABLE_CACHE]
//!       --cache-engine <TYPE>              "duckdb" or "null" [env: EVENTCACHE_CACHE_ENGINE]
//!       --cache-connection <STR>           Cache database [env: EVENTCACHE_CACHE_CONNECTION]
//!       --cache-max-events-per-sid <N>     Events kept per sensor [env: EVENTCACHE_CACHE_MAX_EVENTS_PER_SID]
//!       --cache-cleanup-interval <SECS>    Seconds between cleanups [env: EVENTCACHE_CACHE_CLEANUP_INTERVAL]
//!       --store-engine <TYPE>              Durable store engine [env: EVENTCACHE_STORE_ENGINE]
//!       --store-connection <STR>           Durable store database [env: EVENTCACHE_STORE_CONNECTION]
//!       --store-options <KEY=VAL>          Durable store options [env: EVENTCACHE_STORE_OPTIONS]
//!       --batch-size <N>                   Events per result batch [env: EVENTCACHE_BATCH_SIZE]
//!       --ack-timeout-ms <MS>              Wait for "sendNextBatch" [env: EVENTCACHE_ACK_TIMEOUT_MS]
//!       --max-blocking-threads <N>         Storage I/O threads [env: EVENTCACHE_MAX_BLOCKING_THREADS]
//!       --query-sids <SID,...>             Sensors to query once input is stored
//!       --since <RFC3339>                  Range start (inclusive)
//!       --until <RFC3339>                  Range end (inclusive)
//! ```
//!
//! # Examples
//!
//! ```bash
//! # Store events, then print the latest value of two sensors
//! pulsestore --query-sids sensor-1,sensor-2 < events.ndjson
//!
//! # Persistent durable store, one hour of history for one sensor
//! pulsestore \
//!   --store-connection /var/lib/pulsestore/events.duckdb \
//!   --query-sids sensor-1 \
//!   --since 2024-03-01T12:00:00Z \
//!   --until 2024-03-01T13:00:00Z < events.ndjson
//!
//! # Run without a cache
//! RUST_LOG=debug pulsestore --enable-cache false < events.ndjson
//! ```

use clap::Parser;
use eventcache_core::config::{CliArgs, Settings};
use eventcache_core::storage::{open_cache, open_store, QueryRouter};
use eventcache_core::{batch_channel, QuerySpec};
use pulsestore::{IntakeHandle, IntakeRouter, PullWorker, ServiceSettings};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sensor event persistence tier")]
struct Args {
    #[command(flatten)]
    storage: CliArgs,

    /// Sensors to query once input is stored
    #[arg(long, value_delimiter = ',')]
    query_sids: Option<Vec<String>>,

    /// Range start (inclusive)
    #[arg(long, requires = "until")]
    since: Option<String>,

    /// Range end (inclusive)
    #[arg(long, requires = "since")]
    until: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let storage = Settings::new(args.storage)?;
    let service = ServiceSettings::new()?;
    info!(settings = %storage.redacted(), intake = ?service.intake, drain = ?service.drain, "configuration loaded");

    let query = match args.query_sids {
        Some(sids) => Some(QuerySpec::from_bounds(sids, args.since.as_deref(), args.until.as_deref())?),
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(storage.runtime.max_blocking_threads.max(1))
        .build()?;
    runtime.block_on(run(storage, service, query))
}

async fn run(
    storage: Settings,
    service: ServiceSettings,
    query: Option<QuerySpec>,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open_cache(&storage.cache, &storage.streaming)?;
    let store = open_store(&storage.store, &storage.streaming)?;
    store.start().await?;
    cache.start().await?;
    info!(cache = cache.kind(), store = store.kind(), "storage started");

    let (intake, intake_task) =
        IntakeRouter::new(&service.intake, cache.clone()).spawn(service.intake.mailbox_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pull_delay = Duration::from_millis(service.drain.pull_delay_ms);
    let writer = service.drain.enabled.then(|| {
        PullWorker::new(intake.clone(), store.clone(), pull_delay).spawn(shutdown_rx)
    });

    ingest_stdin(&intake).await?;
    if writer.is_some() {
        wait_until_drained(&intake, pull_delay).await?;
    }

    if let Some(spec) = query {
        let router = QueryRouter::new(cache.clone(), store.clone());
        let (sender, receiver) = batch_channel("cli-query");
        router.query(&spec, sender).await?;
        for event in receiver.collect_events().await? {
            println!("{}", event.encode());
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(writer) = writer {
        writer.await?;
    }
    let stats = intake.shutdown().await?;
    intake_task.await?;
    info!(?stats, "intake finished");

    cache.stop().await?;
    store.stop().await?;
    Ok(())
}

async fn ingest_stdin(intake: &IntakeHandle) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let events = match serde_json::from_str::<Value>(&line) {
            Ok(Value::Array(events)) => events,
            Ok(event) => vec![event],
            Err(e) => {
                warn!(error = %e, "skipping malformed input line");
                continue;
            }
        };
        intake.accept(events).await?;
    }
    Ok(())
}

async fn wait_until_drained(
    intake: &IntakeHandle,
    poll: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    while intake.stats().await?.queued > 0 {
        tokio::time::sleep(poll).await;
    }
    // One more period so the writer finishes the batch it pulled last.
    tokio::time::sleep(poll).await;
    Ok(())
}
