use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub mod bus;
pub mod kafka;
pub mod memory;
pub mod retry;
pub mod telemetry;

pub use bus::{consume, Delivery, Headers, MessageHandler, Publisher, Record, Subscription};
pub use kafka::{KafkaBus, KafkaSubscription};
pub use memory::{MemoryBus, MemorySubscription};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use telemetry::{init_tracing, shutdown_signal};

pub type OrderId = i32;
pub type ProductId = i32;
pub type UserId = i32;

/// Every event type that travels on the bus. Each one is also the name of the
/// topic it is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "order.created")]
    OrderCreated,
    #[serde(rename = "order.confirmed")]
    OrderConfirmed,
    #[serde(rename = "order.failed")]
    OrderFailed,
    #[serde(rename = "order.shipped")]
    OrderShipped,
    #[serde(rename = "order.delivered")]
    OrderDelivered,
}

impl EventType {
    /// Status-change events that customers are notified about.
    pub const OUTCOMES: [EventType; 4] = [
        EventType::OrderConfirmed,
        EventType::OrderFailed,
        EventType::OrderShipped,
        EventType::OrderDelivered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "order.created",
            EventType::OrderConfirmed => "order.confirmed",
            EventType::OrderFailed => "order.failed",
            EventType::OrderShipped => "order.shipped",
            EventType::OrderDelivered => "order.delivered",
        }
    }

    pub fn topic(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Confirmed,
    Shipped,
    Delivered,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected event type {0}")]
    UnexpectedType(EventType),
}

/// Immutable envelope shared by every event on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event<T> {
    pub event_id: String,
    pub event_type: EventType,
    pub order_id: OrderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub timestamp: DateTime<Utc>,
    pub data: T,
}

impl<T> Event<T> {
    pub fn new(event_type: EventType, order_id: OrderId, user_id: Option<UserId>, data: T) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            order_id,
            user_id,
            timestamp: Utc::now(),
            data,
        }
    }
}

impl<T: Serialize> Event<T> {
    /// Encodes the event for its topic, partitioned by order id.
    pub fn to_record(&self) -> Result<Record, serde_json::Error> {
        let payload = serde_json::to_string(self)?;
        Ok(Record::new(self.event_type.topic(), payload).with_key(self.order_id.to_string()))
    }
}

impl<T: DeserializeOwned> Event<T> {
    pub fn decode(payload: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: ProductId,
    pub quantity: i32,
}

/// Payload of `order.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub total_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<serde_json::Value>,
}

pub type OrderCreatedEvent = Event<OrderCreated>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shortage {
    pub product_id: ProductId,
    pub requested: i32,
    pub available: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetails {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insufficient_stock: Vec<Shortage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The closed set of status-change outcomes an order can be announced with.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Confirmed { reservations: Vec<i32> },
    Failed(FailureDetails),
    Shipped { metadata: serde_json::Map<String, serde_json::Value> },
    Delivered { metadata: serde_json::Map<String, serde_json::Value> },
}

impl Outcome {
    pub fn event_type(&self) -> EventType {
        match self {
            Outcome::Confirmed { .. } => EventType::OrderConfirmed,
            Outcome::Failed(_) => EventType::OrderFailed,
            Outcome::Shipped { .. } => EventType::OrderShipped,
            Outcome::Delivered { .. } => EventType::OrderDelivered,
        }
    }

    pub fn status(&self) -> OrderStatus {
        match self {
            Outcome::Confirmed { .. } => OrderStatus::Confirmed,
            Outcome::Failed(_) => OrderStatus::Failed,
            Outcome::Shipped { .. } => OrderStatus::Shipped,
            Outcome::Delivered { .. } => OrderStatus::Delivered,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmedData {
    status: OrderStatus,
    #[serde(default)]
    reservations: Vec<i32>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailedData {
    status: OrderStatus,
    #[serde(flatten)]
    details: FailureDetails,
}

/// A decoded status-change event.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeEvent {
    pub event_id: String,
    pub order_id: OrderId,
    pub user_id: Option<UserId>,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
}

impl OutcomeEvent {
    pub fn new(order_id: OrderId, user_id: Option<UserId>, outcome: Outcome) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            order_id,
            user_id,
            timestamp: Utc::now(),
            outcome,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.outcome.event_type()
    }

    pub fn status(&self) -> OrderStatus {
        self.outcome.status()
    }

    /// The `data` object as it appears on the wire: `{status, ...metadata}`.
    pub fn data(&self) -> Result<serde_json::Value, serde_json::Error> {
        let status = self.status();
        match &self.outcome {
            Outcome::Confirmed { reservations } => serde_json::to_value(ConfirmedData {
                status,
                reservations: reservations.clone(),
            }),
            Outcome::Failed(details) => serde_json::to_value(FailedData {
                status,
                details: details.clone(),
            }),
            Outcome::Shipped { metadata } | Outcome::Delivered { metadata } => {
                let mut data = metadata.clone();
                data.insert("status".to_string(), serde_json::to_value(status)?);
                Ok(serde_json::Value::Object(data))
            }
        }
    }

    pub fn to_event(&self) -> Result<Event<serde_json::Value>, serde_json::Error> {
        Ok(Event {
            event_id: self.event_id.clone(),
            event_type: self.event_type(),
            order_id: self.order_id,
            user_id: self.user_id,
            timestamp: self.timestamp,
            data: self.data()?,
        })
    }

    pub fn to_record(&self) -> Result<Record, serde_json::Error> {
        self.to_event()?.to_record()
    }

    pub fn decode(payload: &str) -> Result<Self, EventError> {
        Event::<serde_json::Value>::decode(payload)?.try_into()
    }
}

impl TryFrom<Event<serde_json::Value>> for OutcomeEvent {
    type Error = EventError;

    fn try_from(event: Event<serde_json::Value>) -> Result<Self, Self::Error> {
        let outcome = match event.event_type {
            EventType::OrderCreated => return Err(EventError::UnexpectedType(event.event_type)),
            EventType::OrderConfirmed => {
                let data: ConfirmedData = serde_json::from_value(event.data)?;
                Outcome::Confirmed { reservations: data.reservations }
            }
            EventType::OrderFailed => {
                let data: FailedData = serde_json::from_value(event.data)?;
                Outcome::Failed(data.details)
            }
            EventType::OrderShipped | EventType::OrderDelivered => {
                let mut metadata = match event.data {
                    serde_json::Value::Object(map) => map,
                    serde_json::Value::Null => serde_json::Map::new(),
                    other => {
                        return Err(EventError::Malformed(serde::de::Error::custom(format!(
                            "expected object data, found {other}"
                        ))))
                    }
                };
                metadata.remove("status");
                if event.event_type == EventType::OrderShipped {
                    Outcome::Shipped { metadata }
                } else {
                    Outcome::Delivered { metadata }
                }
            }
        };

        Ok(Self {
            event_id: event.event_id,
            order_id: event.order_id,
            user_id: event.user_id,
            timestamp: event.timestamp,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_order_created_wire_format() {
        let payload = json!({
            "eventId": "42-1700000000000",
            "eventType": "order.created",
            "orderId": 42,
            "userId": 7,
            "timestamp": "2024-05-01T10:00:00Z",
            "data": {
                "status": "CREATED",
                "items": [{"productId": 1, "quantity": 5}],
                "totalAmount": 149.95,
                "shippingAddress": "1 Main St"
            }
        })
        .to_string();

        let event = OrderCreatedEvent::decode(&payload).unwrap();
        assert_eq!(event.event_type, EventType::OrderCreated);
        assert_eq!(event.order_id, 42);
        assert_eq!(event.user_id, Some(7));
        assert_eq!(
            event.data.items,
            vec![OrderItem {
                product_id: 1,
                quantity: 5
            }]
        );
    }

    #[test]
    fn test_failed_outcome_carries_status_and_shortages() {
        let event = OutcomeEvent::new(
            9,
            Some(3),
            Outcome::Failed(FailureDetails {
                reason: "Insufficient inventory".to_string(),
                insufficient_stock: vec![Shortage {
                    product_id: 1,
                    requested: 10,
                    available: 5,
                }],
                error: None,
            }),
        );

        let record = event.to_record().unwrap();
        assert_eq!(record.topic, "order.failed");
        assert_eq!(record.key.as_deref(), Some("9"));

        let wire: serde_json::Value = serde_json::from_str(&record.payload).unwrap();
        assert_eq!(wire["eventType"], "order.failed");
        assert_eq!(wire["data"]["status"], "FAILED");
        assert_eq!(wire["data"]["reason"], "Insufficient inventory");
        assert_eq!(
            wire["data"]["insufficientStock"],
            json!([{"productId": 1, "requested": 10, "available": 5}])
        );
        assert!(wire["data"].get("error").is_none());

        assert_eq!(OutcomeEvent::decode(&record.payload).unwrap(), event);
    }

    #[test]
    fn test_shipped_metadata_keeps_extra_fields() {
        let payload = json!({
            "eventId": "e-1",
            "eventType": "order.shipped",
            "orderId": 5,
            "timestamp": "2024-05-01T10:00:00Z",
            "data": {"status": "SHIPPED", "trackingNumber": "TRK-1"}
        })
        .to_string();

        let event = OutcomeEvent::decode(&payload).unwrap();
        assert_eq!(event.status(), OrderStatus::Shipped);
        match &event.outcome {
            Outcome::Shipped { metadata } => {
                assert_eq!(metadata.get("trackingNumber"), Some(&json!("TRK-1")));
                assert!(metadata.get("status").is_none());
            }
            other => panic!("expected shipped outcome, got {other:?}"),
        }
        assert_eq!(event.data().unwrap()["status"], "SHIPPED");
    }

    #[test]
    fn test_order_created_is_not_an_outcome() {
        let payload = json!({
            "eventId": "e-2",
            "eventType": "order.created",
            "orderId": 5,
            "timestamp": "2024-05-01T10:00:00Z",
            "data": {"items": []}
        })
        .to_string();

        assert!(matches!(
            OutcomeEvent::decode(&payload),
            Err(EventError::UnexpectedType(EventType::OrderCreated))
        ));
    }

    #[test]
    fn test_rejects_unknown_event_type() {
        let payload = json!({
            "eventId": "e-3",
            "eventType": "payment.success",
            "orderId": 5,
            "timestamp": "2024-05-01T10:00:00Z",
            "data": {}
        })
        .to_string();

        assert!(matches!(
            OutcomeEvent::decode(&payload),
            Err(EventError::Malformed(_))
        ));
    }
}
