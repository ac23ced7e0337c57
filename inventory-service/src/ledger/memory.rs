use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shared::{OrderId, OrderItem, ProductId, Shortage};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{
    lock_order, Reservation, ReservationLedger, ReservationOutcome, ReservationStatus, StockLevel,
};
use crate::markers::ProcessedEvents;

#[derive(Debug, Clone, Copy)]
struct StockRow {
    total: i32,
    reserved: i32,
}

#[derive(Default)]
struct ReservationTable {
    rows: Vec<Reservation>,
    next_id: i32,
}

impl ReservationTable {
    fn for_order(&self, order_id: OrderId) -> impl Iterator<Item = &Reservation> + '_ {
        self.rows.iter().filter(move |r| r.order_id == order_id)
    }

    fn upsert_pending(&mut self, order_id: OrderId, product_id: ProductId, quantity: i32) -> Reservation {
        if let Some(row) = self
            .rows
            .iter_mut()
            .find(|r| r.order_id == order_id && r.product_id == product_id)
        {
            row.quantity = quantity;
            row.status = ReservationStatus::Pending;
            return row.clone();
        }

        self.next_id += 1;
        let row = Reservation {
            id: self.next_id,
            order_id,
            product_id,
            quantity,
            status: ReservationStatus::Pending,
        };
        self.rows.push(row.clone());
        row
    }
}

#[derive(Default)]
struct Inner {
    stock: RwLock<BTreeMap<ProductId, Arc<AsyncMutex<StockRow>>>>,
    reservations: Mutex<ReservationTable>,
    processed: Mutex<HashMap<String, (String, serde_json::Value)>>,
}

type ProductGuards = BTreeMap<ProductId, OwnedMutexGuard<StockRow>>;

/// Ledger kept in process memory. Each product row sits behind its own
/// async mutex, so concurrent orders on disjoint products never contend.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stock(stock: impl IntoIterator<Item = (ProductId, i32)>) -> Self {
        let ledger = Self::new();
        {
            let mut rows = ledger.inner.stock.write();
            for (product_id, total) in stock {
                rows.insert(
                    product_id,
                    Arc::new(AsyncMutex::new(StockRow { total, reserved: 0 })),
                );
            }
        }
        ledger
    }

    /// Sets the total quantity of a product, creating its row if needed.
    /// A total below what is already reserved is refused.
    pub async fn set_stock(&self, product_id: ProductId, total: i32) -> Result<()> {
        if total < 0 {
            bail!("invalid stock {} for product {}", total, product_id);
        }
        let row = {
            let mut rows = self.inner.stock.write();
            Arc::clone(rows.entry(product_id).or_insert_with(|| {
                Arc::new(AsyncMutex::new(StockRow { total: 0, reserved: 0 }))
            }))
        };
        let mut row = row.lock().await;
        if total < row.reserved {
            bail!(
                "stock {} for product {} is below the {} units reserved",
                total,
                product_id,
                row.reserved
            );
        }
        row.total = total;
        Ok(())
    }

    /// Locks the given products in ascending id order. Unknown products are
    /// skipped.
    async fn lock_products(&self, product_ids: BTreeSet<ProductId>) -> ProductGuards {
        let rows: Vec<(ProductId, Arc<AsyncMutex<StockRow>>)> = {
            let stock = self.inner.stock.read();
            product_ids
                .into_iter()
                .filter_map(|id| stock.get(&id).map(|row| (id, Arc::clone(row))))
                .collect()
        };

        let mut guards = ProductGuards::new();
        for (product_id, row) in rows {
            guards.insert(product_id, row.lock_owned().await);
        }
        guards
    }

    fn pending_products(&self, order_id: OrderId) -> BTreeSet<ProductId> {
        self.inner
            .reservations
            .lock()
            .for_order(order_id)
            .filter(|r| r.status == ReservationStatus::Pending)
            .map(|r| r.product_id)
            .collect()
    }
}

#[async_trait]
impl ReservationLedger for MemoryLedger {
    async fn reserve_or_reject(
        &self,
        order_id: OrderId,
        items: &[OrderItem],
    ) -> Result<ReservationOutcome> {
        let wanted = lock_order(items)?;
        let mut guards = self.lock_products(wanted.keys().copied().collect()).await;

        // Read under the product locks so replays of one order serialize.
        {
            let table = self.inner.reservations.lock();
            let active: Vec<Reservation> = table
                .for_order(order_id)
                .filter(|r| r.status != ReservationStatus::Released)
                .cloned()
                .collect();
            if !active.is_empty() {
                return Ok(ReservationOutcome::Accepted {
                    reservations: sorted_by_product(active),
                });
            }
        }

        let shortages: Vec<Shortage> = wanted
            .iter()
            .filter_map(|(&product_id, &requested)| {
                let available = guards
                    .get(&product_id)
                    .map(|row| row.total - row.reserved)
                    .unwrap_or(0);
                (available < requested).then_some(Shortage {
                    product_id,
                    requested,
                    available,
                })
            })
            .collect();

        if !shortages.is_empty() {
            return Ok(ReservationOutcome::Rejected { shortages });
        }

        let mut table = self.inner.reservations.lock();
        let mut reservations = Vec::with_capacity(wanted.len());
        for (&product_id, &quantity) in &wanted {
            let Some(row) = guards.get_mut(&product_id) else {
                bail!("product {product_id} is not stocked");
            };
            row.reserved += quantity;
            reservations.push(table.upsert_pending(order_id, product_id, quantity));
        }

        Ok(ReservationOutcome::Accepted { reservations })
    }

    async fn confirm(&self, order_id: OrderId) -> Result<Vec<i32>> {
        let mut guards = self.lock_products(self.pending_products(order_id)).await;

        let mut table = self.inner.reservations.lock();
        let pending: Vec<usize> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.order_id == order_id && r.status == ReservationStatus::Pending)
            .map(|(index, _)| index)
            .collect();

        if let Some(missing) = pending
            .iter()
            .map(|&index| table.rows[index].product_id)
            .find(|product_id| !guards.contains_key(product_id))
        {
            bail!("reservation for order {order_id} references unlocked product {missing}");
        }

        for index in pending {
            let reservation = &mut table.rows[index];
            if let Some(row) = guards.get_mut(&reservation.product_id) {
                row.total -= reservation.quantity;
                row.reserved -= reservation.quantity;
            }
            reservation.status = ReservationStatus::Confirmed;
        }

        let confirmed = sorted_by_product(
            table
                .for_order(order_id)
                .filter(|r| r.status == ReservationStatus::Confirmed)
                .cloned()
                .collect(),
        );
        Ok(confirmed.into_iter().map(|r| r.id).collect())
    }

    async fn release(&self, order_id: OrderId) -> Result<usize> {
        let mut guards = self.lock_products(self.pending_products(order_id)).await;

        let mut table = self.inner.reservations.lock();
        let mut released = 0;
        for reservation in table
            .rows
            .iter_mut()
            .filter(|r| r.order_id == order_id && r.status == ReservationStatus::Pending)
        {
            let Some(row) = guards.get_mut(&reservation.product_id) else {
                continue;
            };
            row.reserved -= reservation.quantity;
            reservation.status = ReservationStatus::Released;
            released += 1;
        }

        Ok(released)
    }

    async fn stock(&self, product_id: ProductId) -> Result<Option<StockLevel>> {
        let guards = self.lock_products(BTreeSet::from([product_id])).await;
        Ok(guards.get(&product_id).map(|row| StockLevel {
            product_id,
            total: row.total,
            reserved: row.reserved,
        }))
    }

    async fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let table = self.inner.reservations.lock();
        Ok(sorted_by_product(table.for_order(order_id).cloned().collect()))
    }
}

#[async_trait]
impl ProcessedEvents for MemoryLedger {
    async fn is_processed(&self, key: &str) -> Result<bool> {
        Ok(self.inner.processed.lock().contains_key(key))
    }

    async fn mark_processed(
        &self,
        key: &str,
        event_id: &str,
        outcome: &serde_json::Value,
    ) -> Result<()> {
        self.inner
            .processed
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| (event_id.to_string(), outcome.clone()));
        Ok(())
    }
}

fn sorted_by_product(mut reservations: Vec<Reservation>) -> Vec<Reservation> {
    reservations.sort_by_key(|r| r.product_id);
    reservations
}
