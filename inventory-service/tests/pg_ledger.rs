//! Postgres ledger integration tests
//!
//! One Postgres container is shared by every test in this file. Each test
//! works on its own product and order ids, so no table is truncated.
//!
//! ```bash
//! cargo test -p inventory-service --test pg_ledger
//! ```

use std::sync::Arc;

use diesel::{Connection, ExpressionMethods, PgConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use diesel_migrations::MigrationHarness;
use futures::future::join_all;
use inventory_service::ledger::{DbPool, ReservationStatus};
use inventory_service::schema::inventory;
use inventory_service::{
    idempotency_key, Disposition, PgLedger, ProcessedEvents, ReservationLedger, ReservationOutcome,
    SagaCoordinator, MIGRATIONS,
};
use shared::*;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let url = connection_string.clone();
            tokio::task::spawn_blocking(move || {
                let mut conn = PgConnection::establish(&url).unwrap();
                conn.run_pending_migrations(MIGRATIONS).unwrap();
            })
            .await
            .unwrap();

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Fresh pool per test; a pool is bound to the runtime that built it.
async fn get_test_pool() -> DbPool {
    let info = get_container_info().await;
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&info.connection_string);
    bb8::Pool::builder().max_size(10).build(config).await.unwrap()
}

async fn seed(pool: &DbPool, product_id: ProductId, quantity: i32) {
    let mut conn = pool.get().await.unwrap();
    diesel::insert_into(inventory::table)
        .values((
            inventory::product_id.eq(product_id),
            inventory::quantity.eq(quantity),
            inventory::reserved_quantity.eq(0),
        ))
        .execute(&mut conn)
        .await
        .unwrap();
}

fn item(product_id: ProductId, quantity: i32) -> OrderItem {
    OrderItem {
        product_id,
        quantity,
    }
}

async fn levels(ledger: &PgLedger, product_id: ProductId) -> (i32, i32) {
    let level = ledger.stock(product_id).await.unwrap().unwrap();
    (level.total, level.reserved)
}

#[tokio::test]
async fn test_migrations_seed_demo_stock() {
    let ledger = PgLedger::new(get_test_pool().await);

    for product_id in 1..=5 {
        let level = ledger.stock(product_id).await.unwrap().unwrap();
        assert!(level.total >= level.reserved);
    }
    assert!(ledger.stock(99_999).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reserve_then_confirm_consumes_stock() {
    let pool = get_test_pool().await;
    seed(&pool, 101, 5).await;
    let ledger = PgLedger::new(pool);

    let reserved = match ledger.reserve_or_reject(1001, &[item(101, 5)]).await.unwrap() {
        ReservationOutcome::Accepted { reservations } => reservations,
        other => panic!("expected acceptance, got {other:?}"),
    };
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].status, ReservationStatus::Pending);
    assert_eq!(levels(&ledger, 101).await, (5, 5));

    let confirmed = ledger.confirm(1001).await.unwrap();
    assert_eq!(confirmed, vec![reserved[0].id]);
    assert_eq!(levels(&ledger, 101).await, (0, 0));

    // Replayed confirm reports the same rows without consuming again.
    assert_eq!(ledger.confirm(1001).await.unwrap(), confirmed);
    assert_eq!(levels(&ledger, 101).await, (0, 0));

    let rows = ledger.reservations(1001).await.unwrap();
    assert_eq!(rows[0].status, ReservationStatus::Confirmed);
}

#[tokio::test]
async fn test_rejection_reports_every_shortage_and_holds_nothing() {
    let pool = get_test_pool().await;
    seed(&pool, 201, 5).await;
    seed(&pool, 202, 1).await;
    seed(&pool, 203, 9).await;
    let ledger = PgLedger::new(pool);

    let outcome = ledger
        .reserve_or_reject(2001, &[item(203, 2), item(201, 10), item(299, 1), item(202, 1)])
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReservationOutcome::Rejected {
            shortages: vec![
                Shortage {
                    product_id: 201,
                    requested: 10,
                    available: 5
                },
                Shortage {
                    product_id: 299,
                    requested: 1,
                    available: 0
                },
            ]
        }
    );
    assert_eq!(levels(&ledger, 201).await, (5, 0));
    assert_eq!(levels(&ledger, 202).await, (1, 0));
    assert_eq!(levels(&ledger, 203).await, (9, 0));
    assert!(ledger.reservations(2001).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_release_returns_held_units() {
    let pool = get_test_pool().await;
    seed(&pool, 301, 8).await;
    let ledger = PgLedger::new(pool);

    ledger.reserve_or_reject(3001, &[item(301, 3)]).await.unwrap();
    assert_eq!(levels(&ledger, 301).await, (8, 3));

    assert_eq!(ledger.release(3001).await.unwrap(), 1);
    assert_eq!(levels(&ledger, 301).await, (8, 0));
    let rows = ledger.reservations(3001).await.unwrap();
    assert_eq!(rows[0].status, ReservationStatus::Released);

    assert_eq!(ledger.release(3001).await.unwrap(), 0);
    assert_eq!(levels(&ledger, 301).await, (8, 0));

    // A released order may reserve again on the same rows.
    ledger.reserve_or_reject(3001, &[item(301, 2)]).await.unwrap();
    let rows = ledger.reservations(3001).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].quantity, rows[0].status), (2, ReservationStatus::Pending));
    assert_eq!(levels(&ledger, 301).await, (8, 2));
}

#[tokio::test]
async fn test_reserve_is_idempotent_per_order() {
    let pool = get_test_pool().await;
    seed(&pool, 501, 10).await;
    let ledger = PgLedger::new(pool);

    let first = ledger.reserve_or_reject(5001, &[item(501, 4)]).await.unwrap();
    let second = ledger.reserve_or_reject(5001, &[item(501, 4)]).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(levels(&ledger, 501).await, (10, 4));
}

#[tokio::test]
async fn test_markers_keep_first_outcome() {
    let ledger = PgLedger::new(get_test_pool().await);
    let key = idempotency_key(6001, EventType::OrderCreated);

    assert!(!ledger.is_processed(&key).await.unwrap());
    ledger
        .mark_processed(&key, "e-1", &serde_json::json!({"n": 1}))
        .await
        .unwrap();
    ledger
        .mark_processed(&key, "e-2", &serde_json::json!({"n": 2}))
        .await
        .unwrap();
    assert!(ledger.is_processed(&key).await.unwrap());
}

#[tokio::test]
async fn test_coordinator_confirms_against_postgres() {
    let pool = get_test_pool().await;
    seed(&pool, 701, 5).await;
    let ledger = PgLedger::new(pool);
    let bus = MemoryBus::new();
    let saga = SagaCoordinator::new(ledger.clone(), ledger.clone(), Arc::new(bus.clone()));

    let record = Event::new(
        EventType::OrderCreated,
        7001,
        Some(3),
        OrderCreated {
            items: vec![item(701, 5)],
            total_amount: 0.0,
            shipping_address: None,
        },
    )
    .to_record()
    .unwrap();

    let disposition = saga.handle_order_created(&record.payload).await.unwrap();
    assert!(matches!(disposition, Disposition::Confirmed { .. }));
    assert_eq!(
        saga.handle_order_created(&record.payload).await.unwrap(),
        Disposition::Duplicate
    );

    assert_eq!(bus.records("order.confirmed").len(), 1);
    assert_eq!(levels(&ledger, 701).await, (0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_orders_never_oversell() {
    let pool = get_test_pool().await;
    seed(&pool, 401, 7).await;
    let ledger = PgLedger::new(pool);

    let attempts = (0..20).map(|n| {
        let ledger = ledger.clone();
        tokio::spawn(async move { ledger.reserve_or_reject(4001 + n, &[item(401, 1)]).await })
    });
    let outcomes = join_all(attempts).await;

    let accepted = outcomes
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .filter(|outcome| matches!(outcome, ReservationOutcome::Accepted { .. }))
        .count();

    assert_eq!(accepted, 7);
    assert_eq!(levels(&ledger, 401).await, (7, 7));
}
