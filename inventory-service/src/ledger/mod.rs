//! The reservation ledger: sole owner of inventory and reservation rows.
//!
//! Every implementation follows the same discipline. All products touched by
//! one call are locked exclusively in ascending product-id order, the whole
//! order is evaluated before anything is written, and either every item is
//! reserved or none is.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use shared::{OrderId, OrderItem, ProductId, Shortage};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::{DbPool, PgLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Released => "RELEASED",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(ReservationStatus::Pending),
            "CONFIRMED" => Ok(ReservationStatus::Confirmed),
            "RELEASED" => Ok(ReservationStatus::Released),
            other => bail!("unknown reservation status: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: i32,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: i32,
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    Accepted { reservations: Vec<Reservation> },
    Rejected { shortages: Vec<Shortage> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLevel {
    pub product_id: ProductId,
    pub total: i32,
    pub reserved: i32,
}

impl StockLevel {
    pub fn available(&self) -> i32 {
        self.total - self.reserved
    }
}

#[async_trait]
pub trait ReservationLedger: Send + Sync {
    /// Reserves every item of the order or nothing at all.
    ///
    /// Rejection lists a shortage for every item that cannot be covered, not
    /// just the first; unknown products report zero availability. Calling it
    /// again for an order that already holds PENDING or CONFIRMED
    /// reservations returns those reservations unchanged.
    async fn reserve_or_reject(
        &self,
        order_id: OrderId,
        items: &[OrderItem],
    ) -> Result<ReservationOutcome>;

    /// Turns the order's PENDING reservations into consumed stock and returns
    /// the ids of all its CONFIRMED reservations.
    async fn confirm(&self, order_id: OrderId) -> Result<Vec<i32>>;

    /// Returns the order's PENDING reservations to available stock. Returns
    /// how many were released.
    async fn release(&self, order_id: OrderId) -> Result<usize>;

    async fn stock(&self, product_id: ProductId) -> Result<Option<StockLevel>>;

    async fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>>;
}

#[async_trait]
impl<L: ReservationLedger + ?Sized> ReservationLedger for Arc<L> {
    async fn reserve_or_reject(
        &self,
        order_id: OrderId,
        items: &[OrderItem],
    ) -> Result<ReservationOutcome> {
        (**self).reserve_or_reject(order_id, items).await
    }

    async fn confirm(&self, order_id: OrderId) -> Result<Vec<i32>> {
        (**self).confirm(order_id).await
    }

    async fn release(&self, order_id: OrderId) -> Result<usize> {
        (**self).release(order_id).await
    }

    async fn stock(&self, product_id: ProductId) -> Result<Option<StockLevel>> {
        (**self).stock(product_id).await
    }

    async fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        (**self).reservations(order_id).await
    }
}

/// Merges duplicate product lines and yields them in lock order.
pub(crate) fn lock_order(items: &[OrderItem]) -> Result<BTreeMap<ProductId, i32>> {
    let mut wanted = BTreeMap::new();
    for item in items {
        if item.quantity <= 0 {
            bail!(
                "invalid quantity {} for product {}",
                item.quantity,
                item.product_id
            );
        }
        let total = wanted.entry(item.product_id).or_insert(0i32);
        *total = match total.checked_add(item.quantity) {
            Some(sum) => sum,
            None => bail!("total quantity for product {} overflows", item.product_id),
        };
    }
    Ok(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_order_merges_and_sorts() {
        let items = vec![
            OrderItem {
                product_id: 7,
                quantity: 1,
            },
            OrderItem {
                product_id: 2,
                quantity: 3,
            },
            OrderItem {
                product_id: 7,
                quantity: 4,
            },
        ];

        let wanted = lock_order(&items).unwrap();
        assert_eq!(wanted.into_iter().collect::<Vec<_>>(), vec![(2, 3), (7, 5)]);
    }

    #[test]
    fn test_lock_order_rejects_non_positive_quantity() {
        let items = vec![OrderItem {
            product_id: 1,
            quantity: 0,
        }];
        assert!(lock_order(&items).is_err());
    }

    #[test]
    fn test_lock_order_rejects_overflowing_merge() {
        let items = vec![
            OrderItem {
                product_id: 1,
                quantity: i32::MAX,
            },
            OrderItem {
                product_id: 1,
                quantity: i32::MAX,
            },
        ];
        assert!(lock_order(&items).is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ReservationStatus::Pending,
            ReservationStatus::Confirmed,
            ReservationStatus::Released,
        ] {
            assert_eq!(status.as_str().parse::<ReservationStatus>().unwrap(), status);
        }
        assert!("CANCELLED".parse::<ReservationStatus>().is_err());
    }
}
