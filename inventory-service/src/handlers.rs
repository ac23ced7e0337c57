use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::*;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::ledger::{lock_order, ReservationLedger, ReservationOutcome};
use crate::markers::{idempotency_key, ProcessedEvents};

/// What the coordinator did with one `order.created` delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Confirmed { reservations: Vec<i32> },
    Rejected { shortages: Vec<Shortage> },
    Failed { reason: String },
    Duplicate,
    Skipped,
}

/// Drives one order through reserve, confirm or release, and announces the
/// terminal outcome exactly once per order.
pub struct SagaCoordinator<L, M> {
    ledger: L,
    markers: M,
    publisher: Arc<dyn Publisher>,
}

impl<L, M> SagaCoordinator<L, M>
where
    L: ReservationLedger,
    M: ProcessedEvents,
{
    pub fn new(ledger: L, markers: M, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            ledger,
            markers,
            publisher,
        }
    }

    /// Processes one raw `order.created` payload. `Err` means the outcome
    /// could not be published and the delivery must be redelivered.
    pub async fn handle_order_created(&self, payload: &str) -> Result<Disposition> {
        let event = match OrderCreatedEvent::decode(payload) {
            Ok(event) if event.event_type == EventType::OrderCreated => event,
            Ok(event) => {
                warn!(event_type = %event.event_type, "Skipping unexpected event type");
                return Ok(Disposition::Skipped);
            }
            Err(e) => {
                error!("Skipping malformed order.created payload: {}", e);
                return Ok(Disposition::Skipped);
            }
        };

        let order_id = event.order_id;
        let key = idempotency_key(order_id, EventType::OrderCreated);

        if self.markers.is_processed(&key).await? {
            info!(order_id, "Order already processed, skipping duplicate delivery");
            return Ok(Disposition::Duplicate);
        }

        info!(order_id, items = event.data.items.len(), "Processing order");

        let (outcome, disposition) = self.run_saga(&event).await;
        let outcome = OutcomeEvent::new(order_id, event.user_id, outcome);

        let record = outcome.to_record()?;
        self.publisher
            .publish(record)
            .await
            .with_context(|| format!("publishing {} for order {}", outcome.event_type(), order_id))?;

        info!(order_id, event_type = %outcome.event_type(), "Published order outcome");

        let recorded = match outcome.data() {
            Ok(data) => self.markers.mark_processed(&key, &event.event_id, &data).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = recorded {
            error!(order_id, "Error recording processed marker: {:#}", e);
        }

        Ok(disposition)
    }

    async fn run_saga(&self, event: &OrderCreatedEvent) -> (Outcome, Disposition) {
        let order_id = event.order_id;

        if let Err(reason) = validate_items(&event.data.items) {
            warn!(order_id, "Rejecting invalid order: {}", reason);
            return failed("Invalid order", Vec::new(), Some(reason));
        }

        match self.reserve_and_settle(order_id, &event.data.items).await {
            Ok(settled) => settled,
            Err(e) => {
                error!(order_id, "Error processing order: {:#}", e);
                if let Err(e) = self.ledger.release(order_id).await {
                    error!(order_id, "Error releasing reservations: {:#}", e);
                }
                failed("Processing error", Vec::new(), Some(format!("{e:#}")))
            }
        }
    }

    async fn reserve_and_settle(
        &self,
        order_id: OrderId,
        items: &[OrderItem],
    ) -> Result<(Outcome, Disposition)> {
        match self.ledger.reserve_or_reject(order_id, items).await? {
            ReservationOutcome::Rejected { shortages } => {
                let released = self.ledger.release(order_id).await?;
                info!(
                    order_id,
                    shortages = shortages.len(),
                    released,
                    "Insufficient inventory"
                );
                Ok(failed("Insufficient inventory", shortages, None))
            }
            ReservationOutcome::Accepted { reservations } => {
                info!(order_id, reserved = reservations.len(), "Inventory reserved");
                let confirmed = self.ledger.confirm(order_id).await?;
                info!(order_id, reservations = ?confirmed, "Reservations confirmed");
                Ok((
                    Outcome::Confirmed {
                        reservations: confirmed.clone(),
                    },
                    Disposition::Confirmed {
                        reservations: confirmed,
                    },
                ))
            }
        }
    }
}

fn failed(
    reason: &str,
    insufficient_stock: Vec<Shortage>,
    error: Option<String>,
) -> (Outcome, Disposition) {
    let disposition = if insufficient_stock.is_empty() {
        Disposition::Failed {
            reason: reason.to_string(),
        }
    } else {
        Disposition::Rejected {
            shortages: insufficient_stock.clone(),
        }
    };

    let outcome = Outcome::Failed(FailureDetails {
        reason: reason.to_string(),
        insufficient_stock,
        error,
    });
    (outcome, disposition)
}

fn validate_items(items: &[OrderItem]) -> Result<(), String> {
    if items.is_empty() {
        return Err("order has no items".to_string());
    }
    lock_order(items).map(|_| ()).map_err(|e| e.to_string())
}

#[async_trait]
impl<L, M> MessageHandler for SagaCoordinator<L, M>
where
    L: ReservationLedger,
    M: ProcessedEvents,
{
    fn name(&self) -> &str {
        "saga-coordinator"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        self.handle_order_created(&delivery.record.payload)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_items() {
        assert!(validate_items(&[]).is_err());
        assert!(validate_items(&[OrderItem {
            product_id: 1,
            quantity: -2
        }])
        .is_err());
        assert!(validate_items(&[OrderItem {
            product_id: 1,
            quantity: 2
        }])
        .is_ok());
        assert!(validate_items(&[
            OrderItem {
                product_id: 1,
                quantity: i32::MAX
            },
            OrderItem {
                product_id: 1,
                quantity: i32::MAX
            },
        ])
        .is_err());
    }

    #[test]
    fn test_insufficient_inventory_is_a_rejection() {
        let shortage = Shortage {
            product_id: 1,
            requested: 10,
            available: 5,
        };
        let (outcome, disposition) =
            failed("Insufficient inventory", vec![shortage.clone()], None);

        assert_eq!(
            disposition,
            Disposition::Rejected {
                shortages: vec![shortage]
            }
        );
        assert_eq!(outcome.event_type(), EventType::OrderFailed);
    }
}
