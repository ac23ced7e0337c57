use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::ledger::{Reservation, StockLevel};

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::inventory)]
pub struct InventoryRow {
    pub product_id: i32,
    pub quantity: i32,
    pub reserved_quantity: i32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl InventoryRow {
    pub fn available(&self) -> i32 {
        self.quantity - self.reserved_quantity
    }
}

impl From<InventoryRow> for StockLevel {
    fn from(row: InventoryRow) -> Self {
        Self {
            product_id: row.product_id,
            total: row.quantity,
            reserved: row.reserved_quantity,
        }
    }
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct DbReservation {
    pub id: i32,
    pub order_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct NewReservation {
    pub order_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_events)]
pub struct ProcessedEvent {
    pub idempotency_key: String,
    pub event_id: String,
    pub outcome: Option<serde_json::Value>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbReservation> for Reservation {
    type Error = anyhow::Error;

    fn try_from(row: DbReservation) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            product_id: row.product_id,
            quantity: row.quantity,
            status: row.status.parse()?,
        })
    }
}
