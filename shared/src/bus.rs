//! Broker-neutral publish/subscribe seam used by every consumer loop.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub type Headers = BTreeMap<String, String>;

/// A message as it is written to, and read back from, a topic or queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: Option<String>,
    pub payload: String,
    pub headers: Headers,
}

impl Record {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A record handed to a consumer together with its position in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub record: Record,
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, record: Record) -> Result<()>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, record: Record) -> Result<()> {
        (**self).publish(record).await
    }
}

/// A consumer-group membership on one or more topics.
///
/// `ack` marks the delivery as fully handled so the group never sees it
/// again. `nack` rewinds to the delivery so it is handed out once more.
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Option<Result<Delivery>>;
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;
    async fn nack(&mut self, delivery: &Delivery) -> Result<()>;
}

/// Handles one delivery at a time. `Ok` means every side effect of the
/// message has happened and it may be acknowledged; `Err` asks for
/// redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, delivery: &Delivery) -> Result<()>;
}

const REDELIVERY_PAUSE: Duration = Duration::from_secs(1);

/// Drives `handler` over `subscription` until `shutdown` fires or the
/// subscription ends. The in-flight message always runs to its ack or nack
/// before the loop observes cancellation.
pub async fn consume<S, H>(mut subscription: S, handler: &H, shutdown: CancellationToken)
where
    S: Subscription,
    H: MessageHandler + ?Sized,
{
    info!(consumer = handler.name(), "consumer started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = subscription.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                error!(consumer = handler.name(), "Error receiving message: {:#}", e);
                continue;
            }
            None => break,
        };

        debug!(
            consumer = handler.name(),
            topic = %delivery.record.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "message received"
        );

        match handler.handle(&delivery).await {
            Ok(()) => {
                if let Err(e) = subscription.ack(&delivery).await {
                    error!(consumer = handler.name(), "Error committing message: {:#}", e);
                }
            }
            Err(e) => {
                error!(
                    consumer = handler.name(),
                    topic = %delivery.record.topic,
                    offset = delivery.offset,
                    "Error handling message, scheduling redelivery: {:#}",
                    e
                );
                if let Err(e) = subscription.nack(&delivery).await {
                    error!(consumer = handler.name(), "Error rewinding message: {:#}", e);
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(REDELIVERY_PAUSE) => {}
                }
            }
        }
    }

    info!(consumer = handler.name(), "consumer stopped");
}
