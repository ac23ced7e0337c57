use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::{OrderId, OrderItem, ProductId, Shortage};

use super::{
    lock_order, Reservation, ReservationLedger, ReservationOutcome, ReservationStatus, StockLevel,
};
use crate::markers::ProcessedEvents;
use crate::models::*;
use crate::schema::*;

pub type DbPool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Ledger backed by Postgres. Row locks (`SELECT ... FOR UPDATE`) are taken
/// inside one transaction per call, in ascending product-id order.
#[derive(Clone)]
pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn into_reservations(rows: Vec<DbReservation>) -> Result<Vec<Reservation>> {
    rows.into_iter().map(Reservation::try_from).collect()
}

#[async_trait]
impl ReservationLedger for PgLedger {
    async fn reserve_or_reject(
        &self,
        order_id: OrderId,
        items: &[OrderItem],
    ) -> Result<ReservationOutcome> {
        let wanted = lock_order(items)?;
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let mut locked = Vec::with_capacity(wanted.len());
                for &product_id in wanted.keys() {
                    let row = inventory::table
                        .find(product_id)
                        .for_update()
                        .first::<InventoryRow>(conn)
                        .await
                        .optional()?;
                    locked.push((product_id, row));
                }

                // Read under the product locks so replays of one order serialize.
                let active = reservations::table
                    .filter(reservations::order_id.eq(order_id))
                    .filter(reservations::status.ne(ReservationStatus::Released.as_str()))
                    .order(reservations::product_id.asc())
                    .load::<DbReservation>(conn)
                    .await?;

                if !active.is_empty() {
                    return Ok(ReservationOutcome::Accepted {
                        reservations: into_reservations(active)?,
                    });
                }

                let shortages: Vec<Shortage> = locked
                    .iter()
                    .filter_map(|(product_id, row)| {
                        let requested = wanted[product_id];
                        let available = row.as_ref().map(InventoryRow::available).unwrap_or(0);
                        (available < requested).then_some(Shortage {
                            product_id: *product_id,
                            requested,
                            available,
                        })
                    })
                    .collect();

                if !shortages.is_empty() {
                    return Ok(ReservationOutcome::Rejected { shortages });
                }

                let mut held = Vec::with_capacity(wanted.len());
                for (&product_id, &quantity) in &wanted {
                    diesel::update(inventory::table.find(product_id))
                        .set((
                            inventory::reserved_quantity.eq(inventory::reserved_quantity + quantity),
                            inventory::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;

                    let new_reservation = NewReservation {
                        order_id,
                        product_id,
                        quantity,
                        status: ReservationStatus::Pending.as_str().to_string(),
                    };

                    let row = diesel::insert_into(reservations::table)
                        .values(&new_reservation)
                        .on_conflict((reservations::order_id, reservations::product_id))
                        .do_update()
                        .set((
                            reservations::quantity.eq(excluded(reservations::quantity)),
                            reservations::status.eq(excluded(reservations::status)),
                            reservations::updated_at.eq(Utc::now()),
                        ))
                        .get_result::<DbReservation>(conn)
                        .await?;

                    held.push(Reservation::try_from(row)?);
                }

                Ok(ReservationOutcome::Accepted { reservations: held })
            })
        })
        .await
    }

    async fn confirm(&self, order_id: OrderId) -> Result<Vec<i32>> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let pending = reservations::table
                    .filter(reservations::order_id.eq(order_id))
                    .filter(reservations::status.eq(ReservationStatus::Pending.as_str()))
                    .order(reservations::product_id.asc())
                    .for_update()
                    .load::<DbReservation>(conn)
                    .await?;

                for reservation in &pending {
                    diesel::update(inventory::table.find(reservation.product_id))
                        .set((
                            inventory::quantity.eq(inventory::quantity - reservation.quantity),
                            inventory::reserved_quantity
                                .eq(inventory::reserved_quantity - reservation.quantity),
                            inventory::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;
                }

                let pending_ids: Vec<i32> = pending.iter().map(|r| r.id).collect();
                diesel::update(reservations::table.filter(reservations::id.eq_any(pending_ids)))
                    .set((
                        reservations::status.eq(ReservationStatus::Confirmed.as_str()),
                        reservations::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                let confirmed = reservations::table
                    .filter(reservations::order_id.eq(order_id))
                    .filter(reservations::status.eq(ReservationStatus::Confirmed.as_str()))
                    .order(reservations::product_id.asc())
                    .select(reservations::id)
                    .load::<i32>(conn)
                    .await?;

                Ok(confirmed)
            })
        })
        .await
    }

    async fn release(&self, order_id: OrderId) -> Result<usize> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let pending = reservations::table
                    .filter(reservations::order_id.eq(order_id))
                    .filter(reservations::status.eq(ReservationStatus::Pending.as_str()))
                    .order(reservations::product_id.asc())
                    .for_update()
                    .load::<DbReservation>(conn)
                    .await?;

                for reservation in &pending {
                    diesel::update(inventory::table.find(reservation.product_id))
                        .set((
                            inventory::reserved_quantity
                                .eq(inventory::reserved_quantity - reservation.quantity),
                            inventory::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;
                }

                let pending_ids: Vec<i32> = pending.iter().map(|r| r.id).collect();
                let released =
                    diesel::update(reservations::table.filter(reservations::id.eq_any(pending_ids)))
                        .set((
                            reservations::status.eq(ReservationStatus::Released.as_str()),
                            reservations::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;

                Ok(released)
            })
        })
        .await
    }

    async fn stock(&self, product_id: ProductId) -> Result<Option<StockLevel>> {
        let mut conn = self.pool.get().await?;
        let row = inventory::table
            .find(product_id)
            .first::<InventoryRow>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(StockLevel::from))
    }

    async fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let mut conn = self.pool.get().await?;
        let rows = reservations::table
            .filter(reservations::order_id.eq(order_id))
            .order(reservations::product_id.asc())
            .load::<DbReservation>(&mut conn)
            .await?;
        into_reservations(rows)
    }
}

#[async_trait]
impl ProcessedEvents for PgLedger {
    async fn is_processed(&self, key: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let found = processed_events::table
            .find(key)
            .select(processed_events::idempotency_key)
            .first::<String>(&mut conn)
            .await
            .optional()?;
        Ok(found.is_some())
    }

    async fn mark_processed(
        &self,
        key: &str,
        event_id: &str,
        outcome: &serde_json::Value,
    ) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let marker = ProcessedEvent {
            idempotency_key: key.to_string(),
            event_id: event_id.to_string(),
            outcome: Some(outcome.clone()),
            processed_at: Some(Utc::now()),
        };

        diesel::insert_into(processed_events::table)
            .values(&marker)
            .on_conflict(processed_events::idempotency_key)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(())
    }
}
