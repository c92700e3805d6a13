//! Configuration management for the storage tier.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/eventcache/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `EVENTCACHE__`, sections separated
//!    by `__`, e.g. `EVENTCACHE__CACHE__CONNECTION`)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.

use crate::batch::BatchStreamer;
use clap::Parser;
use config::{Config, ConfigError};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const DEFAULT_CONFIG_PATH: &str = "/etc/eventcache/config.toml";

/// Command-line arguments parser.
///
/// Every option can also be given through the environment variable named
/// next to it.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable the first-level cache
    #[arg(long, env = "EVENTCACHE_ENABLE_CACHE")]
    enable_cache: Option<bool>,

    /// Cache engine type ("duckdb" or "null")
    #[arg(long, env = "EVENTCACHE_CACHE_ENGINE")]
    cache_engine: Option<String>,

    /// Cache connection string
    #[arg(long, env = "EVENTCACHE_CACHE_CONNECTION")]
    cache_connection: Option<String>,

    /// Number of events kept per sensor by cache cleanup
    #[arg(long, env = "EVENTCACHE_CACHE_MAX_EVENTS_PER_SID")]
    cache_max_events_per_sid: Option<u64>,

    /// Seconds between cache cleanup passes
    #[arg(long, env = "EVENTCACHE_CACHE_CLEANUP_INTERVAL")]
    cache_cleanup_interval: Option<u64>,

    /// Durable store engine type
    #[arg(long, env = "EVENTCACHE_STORE_ENGINE")]
    store_engine: Option<String>,

    /// Durable store connection string
    #[arg(long, env = "EVENTCACHE_STORE_CONNECTION")]
    store_connection: Option<String>,

    /// Durable store options (key=value pairs)
    #[arg(long, env = "EVENTCACHE_STORE_OPTIONS")]
    store_options: Option<Vec<String>>,

    /// Events per streamed result batch
    #[arg(long, env = "EVENTCACHE_BATCH_SIZE")]
    batch_size: Option<u64>,

    /// Milliseconds to wait for a consumer to ask for the next batch
    #[arg(long, env = "EVENTCACHE_ACK_TIMEOUT_MS")]
    ack_timeout_ms: Option<u64>,

    /// Upper bound of threads running storage I/O
    #[arg(long, env = "EVENTCACHE_MAX_BLOCKING_THREADS")]
    max_blocking_threads: Option<u64>,
}

/// Complete storage configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// First-level cache
    #[serde(default)]
    pub cache: CacheConfig,
    /// Durable second-level store
    #[serde(default)]
    pub store: StoreConfig,
    /// Result streaming
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Worker pool
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,
    /// Cache storage engine type ("duckdb" or "null")
    pub engine: String,
    /// Cache connection string
    pub connection: String,
    /// Events kept per sensor after a cleanup pass
    pub max_cached_events_per_sid: usize,
    /// Seconds between cleanup passes
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            engine: "duckdb".to_string(),
            connection: ":memory:".to_string(),
            max_cached_events_per_sid: crate::storage::duckdb::DEFAULT_MAX_CACHED_EVENTS_PER_SID,
            cleanup_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn cleanup_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cleanup_interval_secs.max(1) as i64)
    }
}

/// Durable store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store engine type
    pub engine: String,
    /// Connection string for the engine
    pub connection: String,
    /// Engine-specific options
    pub options: HashMap<String, String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            engine: "duckdb".to_string(),
            connection: ":memory:".to_string(),
            options: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub batch_size: usize,
    pub ack_timeout_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::batch::DEFAULT_BATCH_SIZE,
            ack_timeout_ms: crate::batch::DEFAULT_ACK_TIMEOUT.as_millis() as u64,
        }
    }
}

impl From<&StreamingConfig> for BatchStreamer {
    fn from(config: &StreamingConfig) -> Self {
        BatchStreamer::new(config.batch_size, Duration::from_millis(config.ack_timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound of the blocking pool running storage I/O
    pub max_blocking_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_blocking_threads: 16,
        }
    }
}

impl Settings {
    /// Loads configuration from all available sources.
    pub fn new(cli: CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load default configuration
        builder = builder.add_source(config::File::from_str(
            DEFAULT_CONFIG,
            config::FileFormat::Toml,
        ));

        // Load system configuration if it exists
        if std::fs::metadata(DEFAULT_CONFIG_PATH).is_ok_and(|m| m.is_file()) {
            builder = builder.add_source(config::File::from(PathBuf::from(DEFAULT_CONFIG_PATH)));
        }

        // Load user configuration if specified
        if let Some(ref config_path) = cli.config {
            builder = builder.add_source(config::File::from(config_path.clone()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("EVENTCACHE")
                .prefix_separator("__")
                .separator("__"),
        );

        // Cache settings
        if let Some(enabled) = cli.enable_cache {
            builder = builder.set_override("cache.enabled", enabled)?;
        }
        if let Some(ref engine) = cli.cache_engine {
            builder = builder.set_override("cache.engine", engine.as_str())?;
        }
        if let Some(ref connection) = cli.cache_connection {
            builder = builder.set_override("cache.connection", connection.as_str())?;
        }
        if let Some(max_events) = cli.cache_max_events_per_sid {
            builder = builder.set_override("cache.max_cached_events_per_sid", max_events)?;
        }
        if let Some(interval) = cli.cache_cleanup_interval {
            builder = builder.set_override("cache.cleanup_interval_secs", interval)?;
        }

        // Store settings
        if let Some(ref engine) = cli.store_engine {
            builder = builder.set_override("store.engine", engine.as_str())?;
        }
        if let Some(ref connection) = cli.store_connection {
            builder = builder.set_override("store.connection", connection.as_str())?;
        }
        if let Some(ref options) = cli.store_options {
            builder = builder.set_override("store.options", parse_options(options))?;
        }

        // Streaming and runtime settings
        if let Some(batch_size) = cli.batch_size {
            builder = builder.set_override("streaming.batch_size", batch_size)?;
        }
        if let Some(timeout) = cli.ack_timeout_ms {
            builder = builder.set_override("streaming.ack_timeout_ms", timeout)?;
        }
        if let Some(threads) = cli.max_blocking_threads {
            builder = builder.set_override("runtime.max_blocking_threads", threads)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Printable view of the settings with connection strings blanked.
    pub fn redacted(&self) -> RedactedSettings<'_> {
        RedactedSettings(self)
    }
}

/// Parses `key=value` pairs, ignoring malformed entries.
fn parse_options(options: &[String]) -> HashMap<String, String> {
    options
        .iter()
        .filter_map(|opt| {
            opt.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect()
}

const BLANKED: &str = "<BLANKED>";

/// Display adapter hiding connection strings, which may carry credentials.
pub struct RedactedSettings<'a>(&'a Settings);

impl fmt::Display for RedactedSettings<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        let blank = |connection: &str| if connection == ":memory:" { ":memory:" } else { BLANKED };
        write!(
            f,
            "cache[enabled={}, engine={}, connection={}, max_cached_events_per_sid={}, cleanup_interval_secs={}] \
             store[engine={}, connection={}, options={:?}] \
             streaming[batch_size={}, ack_timeout_ms={}] runtime[max_blocking_threads={}]",
            s.cache.enabled,
            s.cache.engine,
            blank(&s.cache.connection),
            s.cache.max_cached_events_per_sid,
            s.cache.cleanup_interval_secs,
            s.store.engine,
            blank(&s.store.connection),
            s.store.options.keys().collect::<Vec<_>>(),
            s.streaming.batch_size,
            s.streaming.ack_timeout_ms,
            s.runtime.max_blocking_threads,
        )
    }
}
