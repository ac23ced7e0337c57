//! Idempotency markers recording that an inbound event already produced its
//! terminal effect.

use anyhow::Result;
use async_trait::async_trait;
use shared::{EventType, OrderId};
use std::sync::Arc;

#[async_trait]
pub trait ProcessedEvents: Send + Sync {
    async fn is_processed(&self, key: &str) -> Result<bool>;

    /// Records the marker. A marker that already exists is left untouched.
    async fn mark_processed(
        &self,
        key: &str,
        event_id: &str,
        outcome: &serde_json::Value,
    ) -> Result<()>;
}

#[async_trait]
impl<M: ProcessedEvents + ?Sized> ProcessedEvents for Arc<M> {
    async fn is_processed(&self, key: &str) -> Result<bool> {
        (**self).is_processed(key).await
    }

    async fn mark_processed(
        &self,
        key: &str,
        event_id: &str,
        outcome: &serde_json::Value,
    ) -> Result<()> {
        (**self).mark_processed(key, event_id, outcome).await
    }
}

pub fn idempotency_key(order_id: OrderId, event_type: EventType) -> String {
    format!("{order_id}:{event_type}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_format() {
        assert_eq!(idempotency_key(42, EventType::OrderCreated), "42:order.created");
    }
}
