//! Flow-controlled delivery of query results.
//!
//! Results travel over a duplex channel created with [`batch_channel`]. The
//! producing side ([`BatchSender`]) sends one [`Batch`] at a time and then
//! waits until the consumer replies with [`SEND_NEXT_BATCH`]. The consumer
//! therefore bounds the amount of in-flight data to a single batch.
//!
//! ```rust,no_run
//! use eventcache_core::batch::{batch_channel, BatchStreamer};
//! use eventcache_core::event::Event;
//! use futures::stream;
//!
//! # async fn demo() -> Result<(), tonic::Status> {
//! let (sender, receiver) = batch_channel("query-42");
//! let streamer = BatchStreamer::default();
//! tokio::spawn(async move {
//!     let _ = streamer.stream_results(stream::empty::<Result<Event, tonic::Status>>(), &sender, false).await;
//! });
//! let events = receiver.collect_events().await?;
//! assert!(events.is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! On the wire a batch has the shape
//! `{"batch": [...], "isLast": true, "batchTimestamp": "<RFC 3339>"}` with
//! `isLast` present only on the final batch of a result.

use crate::event::Event;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tonic::Status;
use tracing::{debug, trace, warn};

/// Reply token asking the producer for the next batch.
pub const SEND_NEXT_BATCH: &str = "sendNextBatch";
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// One page of a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(rename = "batch")]
    pub events: Vec<Event>,
    #[serde(rename = "isLast", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_last: bool,
    #[serde(rename = "batchTimestamp")]
    pub batch_timestamp: DateTime<Utc>,
}

impl Batch {
    pub fn new(events: Vec<Event>, is_last: bool) -> Self {
        Self {
            events,
            is_last,
            batch_timestamp: Utc::now(),
        }
    }
}

/// Frames travelling from producer to consumer.
#[derive(Debug)]
pub enum StreamMessage {
    Batch(Delivery),
    /// The producer gave up; no further batches follow.
    Failed(Status),
}

/// A batch together with the handle used to answer it.
#[derive(Debug)]
pub struct Delivery {
    pub batch: Batch,
    reply: Acknowledger,
}

impl Delivery {
    pub fn into_parts(self) -> (Batch, Acknowledger) {
        (self.batch, self.reply)
    }

    /// Acknowledges the batch right away and hands it out.
    pub fn ack(self) -> Batch {
        self.reply.ack();
        self.batch
    }
}

#[derive(Debug)]
pub struct Acknowledger(oneshot::Sender<String>);

impl Acknowledger {
    pub fn ack(self) {
        self.reply(SEND_NEXT_BATCH);
    }

    /// Sends an arbitrary reply. Anything but [`SEND_NEXT_BATCH`] ends the stream.
    pub fn reply(self, token: impl Into<String>) {
        let _ = self.0.send(token.into());
    }
}

/// Creates a connected producer/consumer pair identified by `channel_id`.
pub fn batch_channel(channel_id: impl Into<String>) -> (BatchSender, BatchReceiver) {
    let channel_id = channel_id.into();
    let (tx, rx) = mpsc::channel(1);
    (
        BatchSender {
            channel_id: channel_id.clone(),
            tx,
        },
        BatchReceiver { channel_id, rx },
    )
}

/// Producing half of a result channel. Clones address the same consumer.
#[derive(Debug, Clone)]
pub struct BatchSender {
    channel_id: String,
    tx: mpsc::Sender<StreamMessage>,
}

impl BatchSender {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Sends one batch and waits for the consumer's reply.
    ///
    /// `timeout` covers both handing the batch over and the reply.
    pub async fn send(&self, batch: Batch, timeout: Duration) -> Result<(), Status> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let delivery = Delivery {
            batch,
            reply: Acknowledger(reply_tx),
        };
        let exchange = async {
            self.tx
                .send(StreamMessage::Batch(delivery))
                .await
                .map_err(|_| {
                    Status::unavailable(format!("no consumer on channel {}", self.channel_id))
                })?;
            reply_rx.await.map_err(|_| {
                Status::aborted(format!(
                    "consumer on channel {} dropped the batch without replying",
                    self.channel_id
                ))
            })
        };
        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(Status::deadline_exceeded(format!(
                "no reply on channel {} within {:?}",
                self.channel_id, timeout
            ))),
            Ok(Err(status)) => Err(status),
            Ok(Ok(reply)) if reply == SEND_NEXT_BATCH => Ok(()),
            Ok(Ok(reply)) => Err(Status::aborted(format!(
                "unexpected reply {reply:?} on channel {}",
                self.channel_id
            ))),
        }
    }

    /// Tells the consumer that the stream ended abnormally.
    ///
    /// Best effort: a consumer that is gone or still holding a batch simply
    /// observes the channel closing.
    pub fn fail(&self, status: Status) {
        if self.tx.try_send(StreamMessage::Failed(status)).is_err() {
            debug!(channel = %self.channel_id, "failure frame not delivered");
        }
    }
}

/// Consuming half of a result channel.
#[derive(Debug)]
pub struct BatchReceiver {
    channel_id: String,
    rx: mpsc::Receiver<StreamMessage>,
}

impl BatchReceiver {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Next frame, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        self.rx.recv().await
    }

    /// Flattens the result into events, acknowledging each batch once all of
    /// its events were pulled.
    ///
    /// Ends after the final batch. Yields an error when the producer reports
    /// a failure or disappears before the final batch.
    pub fn into_events(self) -> impl Stream<Item = Result<Event, Status>> + Send {
        let mut receiver = self;
        async_stream::try_stream! {
            loop {
                match receiver.rx.recv().await {
                    Some(StreamMessage::Batch(delivery)) => {
                        let (batch, ack) = delivery.into_parts();
                        trace!(channel = %receiver.channel_id, size = batch.events.len(), "batch received");
                        let is_last = batch.is_last;
                        for event in batch.events {
                            yield event;
                        }
                        ack.ack();
                        if is_last {
                            break;
                        }
                    }
                    Some(StreamMessage::Failed(status)) => {
                        Err::<(), Status>(status)?;
                    }
                    None => {
                        Err::<(), Status>(Status::aborted(format!(
                            "channel {} closed before the final batch",
                            receiver.channel_id
                        )))?;
                    }
                }
            }
        }
    }

    pub async fn collect_events(self) -> Result<Vec<Event>, Status> {
        self.into_events().try_collect().await
    }
}

/// Cuts an event stream into batches and feeds them through a channel one
/// acknowledgment at a time.
#[derive(Debug, Clone, Copy)]
pub struct BatchStreamer {
    batch_size: usize,
    ack_timeout: Duration,
}

impl Default for BatchStreamer {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE, DEFAULT_ACK_TIMEOUT)
    }
}

impl BatchStreamer {
    pub fn new(batch_size: usize, ack_timeout: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ack_timeout,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Streams `events` to `sink`.
    ///
    /// A batch is marked final only when the source is exhausted and
    /// `suppress_final` is false; callers chaining several results suppress
    /// the marker on all but the last one. An empty source still produces one
    /// (empty) batch. Resolves once the consumer acknowledged the last batch
    /// sent, or with the first error. An `Err` item of the source is
    /// forwarded to the consumer as a failure frame.
    pub async fn stream_results<S>(
        &self,
        events: S,
        sink: &BatchSender,
        suppress_final: bool,
    ) -> Result<(), Status>
    where
        S: Stream<Item = Result<Event, Status>> + Send,
    {
        let mut events = Box::pin(events.peekable());
        let mut sent = 0usize;
        loop {
            let mut page = Vec::with_capacity(self.batch_size);
            while page.len() < self.batch_size {
                match events.next().await {
                    Some(Ok(event)) => page.push(event),
                    Some(Err(status)) => {
                        warn!(channel = %sink.channel_id(), error = %status, "result source failed");
                        sink.fail(status.clone());
                        return Err(status);
                    }
                    None => break,
                }
            }
            let exhausted = events.as_mut().peek().await.is_none();
            let size = page.len();
            sink.send(Batch::new(page, exhausted && !suppress_final), self.ack_timeout)
                .await
                .inspect_err(|status| {
                    debug!(channel = %sink.channel_id(), error = %status, "batch delivery failed");
                })?;
            sent += size;
            if exhausted {
                trace!(channel = %sink.channel_id(), sent, "result stream complete");
                return Ok(());
            }
        }
    }
}
