use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{Delivery, EventType, MessageHandler, OutcomeEvent, Publisher};
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{Channel, Notification};

/// Fans every status-change event out to one queue per channel.
pub struct NotificationRouter {
    publisher: Arc<dyn Publisher>,
    channels: Vec<Channel>,
}

impl NotificationRouter {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self::with_channels(publisher, Channel::ALL.to_vec())
    }

    pub fn with_channels(publisher: Arc<dyn Publisher>, channels: Vec<Channel>) -> Self {
        Self {
            publisher,
            channels,
        }
    }

    /// Topics the router consumes.
    pub fn topics() -> Vec<&'static str> {
        EventType::OUTCOMES.iter().map(EventType::topic).collect()
    }

    /// Publishes one notification per channel and returns how many were
    /// published. Poison payloads publish nothing. Any failed publish is an
    /// error so the inbound event gets redelivered to every queue.
    pub async fn route(&self, payload: &str) -> Result<usize> {
        let event = match OutcomeEvent::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping event that is not a status change: {}", e);
                return Ok(0);
            }
        };

        info!(
            order_id = event.order_id,
            event_type = %event.event_type(),
            "Routing notification"
        );

        for &channel in &self.channels {
            let record = Notification::from_outcome(&event, channel)?.to_record()?;
            self.publisher
                .publish(record)
                .await
                .with_context(|| format!("publishing to {}", channel.queue()))?;
        }

        Ok(self.channels.len())
    }
}

#[async_trait]
impl MessageHandler for NotificationRouter {
    fn name(&self) -> &str {
        "notification-router"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        self.route(&delivery.record.payload).await.map(|_| ())
    }
}
