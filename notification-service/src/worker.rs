use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{Delivery, MessageHandler, Publisher, Record, RetryDecision, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::channels::ChannelSender;
use crate::models::{Channel, DeadLetter, Notification, ORIGINAL_QUEUE_HEADER, RETRY_COUNT_HEADER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Delivered { message_id: String },
    Retried { attempt: u32, delay: Duration },
    DeadLettered { retry_count: u32 },
    Skipped,
}

/// Delivers notifications from one channel's queue. Failed deliveries are
/// re-queued with exponential backoff until the retry budget runs out, then
/// dead-lettered.
pub struct ChannelWorker {
    sender: Arc<dyn ChannelSender>,
    publisher: Arc<dyn Publisher>,
    policy: RetryPolicy,
    name: String,
}

impl ChannelWorker {
    pub fn new(
        sender: Arc<dyn ChannelSender>,
        publisher: Arc<dyn Publisher>,
        policy: RetryPolicy,
    ) -> Self {
        let name = format!("{}-worker", sender.channel());
        Self {
            sender,
            publisher,
            policy,
            name,
        }
    }

    pub fn channel(&self) -> Channel {
        self.sender.channel()
    }

    pub fn queue(&self) -> &'static str {
        self.channel().queue()
    }

    /// Runs one delivery through the retry state machine. `Err` means the
    /// retry or dead-letter record could not be published.
    pub async fn process(&self, delivery: &Delivery) -> Result<WorkerOutcome> {
        let channel = self.channel();
        let notification = match Notification::decode(&delivery.record.payload) {
            Ok(notification) => notification,
            Err(e) => {
                error!(%channel, "Skipping malformed notification: {}", e);
                return Ok(WorkerOutcome::Skipped);
            }
        };
        let order_id = notification.order_id;
        let retry_count = retry_count(&delivery.record);

        let error = match self.sender.send(&notification).await {
            Ok(receipt) => {
                info!(
                    %channel,
                    order_id,
                    message_id = %receipt.message_id,
                    "Processed notification"
                );
                return Ok(WorkerOutcome::Delivered {
                    message_id: receipt.message_id,
                });
            }
            Err(e) => e,
        };

        match self.policy.decide(retry_count) {
            RetryDecision::Retry { attempt, delay } => {
                warn!(
                    %channel,
                    order_id,
                    retry_count = attempt,
                    max_retries = self.policy.max_retries,
                    ?delay,
                    "Delivery failed, retrying: {:#}",
                    error
                );
                tokio::time::sleep(delay).await;

                let mut retry = delivery.record.clone();
                retry.topic = self.queue().to_string();
                let retry = retry
                    .with_header(RETRY_COUNT_HEADER, attempt.to_string())
                    .with_header(ORIGINAL_QUEUE_HEADER, self.queue());
                self.publisher
                    .publish(retry)
                    .await
                    .with_context(|| format!("re-queueing order {order_id} on {}", self.queue()))?;

                Ok(WorkerOutcome::Retried { attempt, delay })
            }
            RetryDecision::DeadLetter => {
                let entry = DeadLetter {
                    notification,
                    failed_reason: format!("{error:#}"),
                    failed_at: Utc::now(),
                    original_queue: delivery
                        .record
                        .header(ORIGINAL_QUEUE_HEADER)
                        .unwrap_or(self.queue())
                        .to_string(),
                    retry_count,
                };
                self.publisher
                    .publish(entry.to_record()?)
                    .await
                    .with_context(|| format!("dead-lettering order {order_id}"))?;

                error!(
                    %channel,
                    order_id,
                    retry_count,
                    "Notification sent to DLQ after {} retries: {:#}",
                    retry_count,
                    error
                );
                Ok(WorkerOutcome::DeadLettered { retry_count })
            }
        }
    }
}

/// Reads `x-retry-count`, treating a missing or unreadable header as zero.
fn retry_count(record: &Record) -> u32 {
    record
        .header(RETRY_COUNT_HEADER)
        .and_then(|count| count.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl MessageHandler for ChannelWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        self.process(delivery).await.map(|_| ())
    }
}
