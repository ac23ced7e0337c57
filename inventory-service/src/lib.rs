use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub mod api;
pub mod handlers;
pub mod ledger;
pub mod markers;
pub mod models;
pub mod schema;

pub use handlers::{Disposition, SagaCoordinator};
pub use ledger::{MemoryLedger, PgLedger, ReservationLedger, ReservationOutcome};
pub use markers::{idempotency_key, ProcessedEvents};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
