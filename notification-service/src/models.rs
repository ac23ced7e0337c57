use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{EventType, OrderId, OrderStatus, OutcomeEvent, Record, UserId};
use std::fmt;

pub const DEAD_LETTER_QUEUE: &str = "notifications.dlq";

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";
pub const CHANNEL_HEADER: &str = "channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
        }
    }

    /// The dedicated queue this channel's worker consumes.
    pub fn queue(&self) -> &'static str {
        match self {
            Channel::Email => "email.notifications",
            Channel::Sms => "sms.notifications",
            Channel::Push => "push.notifications",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One customer notification bound for a single channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub event_type: EventType,
    pub order_id: OrderId,
    pub user_id: Option<UserId>,
    pub status: OrderStatus,
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Notification {
    pub fn from_outcome(event: &OutcomeEvent, channel: Channel) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: event.event_type(),
            order_id: event.order_id,
            user_id: event.user_id,
            status: event.status(),
            channel,
            timestamp: event.timestamp,
            metadata: event.data()?,
        })
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Encodes the notification for its channel's queue.
    pub fn to_record(&self) -> Result<Record, serde_json::Error> {
        let payload = serde_json::to_string(self)?;
        Ok(Record::new(self.channel.queue(), payload)
            .with_key(self.order_id.to_string())
            .with_header(CHANNEL_HEADER, self.channel.as_str()))
    }
}

/// A notification that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    #[serde(flatten)]
    pub notification: Notification,
    pub failed_reason: String,
    pub failed_at: DateTime<Utc>,
    pub original_queue: String,
    pub retry_count: u32,
}

impl DeadLetter {
    pub fn to_record(&self) -> Result<Record, serde_json::Error> {
        let payload = serde_json::to_string(self)?;
        Ok(Record::new(DEAD_LETTER_QUEUE, payload)
            .with_key(self.notification.order_id.to_string())
            .with_header(CHANNEL_HEADER, self.notification.channel.as_str())
            .with_header(ORIGINAL_QUEUE_HEADER, self.original_queue.as_str())
            .with_header(RETRY_COUNT_HEADER, self.retry_count.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::{FailureDetails, Outcome};

    #[test]
    fn test_notification_from_failed_outcome() {
        let event = OutcomeEvent::new(
            12,
            Some(4),
            Outcome::Failed(FailureDetails {
                reason: "Insufficient inventory".to_string(),
                insufficient_stock: Vec::new(),
                error: None,
            }),
        );

        let notification = Notification::from_outcome(&event, Channel::Sms).unwrap();
        assert_eq!(notification.event_type, EventType::OrderFailed);
        assert_eq!(notification.status, OrderStatus::Failed);
        assert_eq!(notification.metadata["reason"], "Insufficient inventory");

        let record = notification.to_record().unwrap();
        assert_eq!(record.topic, "sms.notifications");
        assert_eq!(record.header(CHANNEL_HEADER), Some("sms"));

        let wire: serde_json::Value = serde_json::from_str(&record.payload).unwrap();
        assert_eq!(wire["eventType"], "order.failed");
        assert_eq!(wire["orderId"], 12);
        assert_eq!(wire["userId"], 4);
        assert_eq!(wire["status"], "FAILED");
        assert_eq!(wire["channel"], "sms");
    }

    #[test]
    fn test_dead_letter_flattens_notification() {
        let notification = Notification {
            event_type: EventType::OrderConfirmed,
            order_id: 3,
            user_id: None,
            status: OrderStatus::Confirmed,
            channel: Channel::Push,
            timestamp: Utc::now(),
            metadata: json!({"status": "CONFIRMED"}),
        };
        let entry = DeadLetter {
            notification,
            failed_reason: "Push service temporarily unavailable".to_string(),
            failed_at: Utc::now(),
            original_queue: Channel::Push.queue().to_string(),
            retry_count: 3,
        };

        let record = entry.to_record().unwrap();
        assert_eq!(record.topic, DEAD_LETTER_QUEUE);

        let wire: serde_json::Value = serde_json::from_str(&record.payload).unwrap();
        assert_eq!(wire["orderId"], 3);
        assert_eq!(wire["failedReason"], "Push service temporarily unavailable");
        assert_eq!(wire["originalQueue"], "push.notifications");
        assert_eq!(wire["retryCount"], 3);
    }
}
