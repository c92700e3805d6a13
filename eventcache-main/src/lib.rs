/*!
# Eventcache: first-level caching and batch-streamed queries for sensor events

Eventcache is the storage half of a sensor-event persistence tier. It keeps
the most recent events of every sensor in an embedded DuckDB cache, stores
the full history in a durable DuckDB store, and answers range and latest-value
queries by streaming results in flow-controlled batches.

## Key Features

### Bounded first-level cache
- Idempotent writes keyed by hour bucket, millisecond bucket, sensor and content hash
- Periodic pruning to the newest N events per sensor, at most once per interval
- Range queries answered only when the cache reaches back to the start of the range

### Durable second-level store
- Same identity and deduplication rules as the cache
- Paged range reads, so long histories are never loaded at once

### Consumer-driven result streaming
- Results delivered in batches of a configurable size
- The next batch is sent only after the consumer asks for it
- Exactly one final batch per result, or an explicit failure

### Cache-first query routing
- Queries the cache cannot answer fall through to the durable store on the same channel

## Usage

```rust,no_run
use eventcache_core::batch::batch_channel;
use eventcache_core::config::Settings;
use eventcache_core::query::QuerySpec;
use eventcache_core::storage::{open_cache, open_store, QueryRouter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::default();
    let cache = open_cache(&settings.cache, &settings.streaming)?;
    let store = open_store(&settings.store, &settings.streaming)?;
    cache.start().await?;
    store.start().await?;

    let router = QueryRouter::new(cache, store);
    let (sender, receiver) = batch_channel("latest-temperatures");
    router.query(&QuerySpec::latest(["sensor-1", "sensor-2"]), sender).await?;
    for event in receiver.collect_events().await? {
        println!("{}", event.encode());
    }
    Ok(())
}
```

For configuration options see the [`config`] module.
*/

pub mod batch;
pub mod config;
pub mod event;
pub mod keys;
pub mod query;
pub mod storage;

pub use batch::{batch_channel, Batch, BatchReceiver, BatchSender, BatchStreamer};
pub use config::Settings;
pub use event::Event;
pub use query::QuerySpec;
pub use storage::{PersistSummary, QueryRouter, StorageService};
