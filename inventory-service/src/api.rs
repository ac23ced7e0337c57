use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use shared::{OrderId, ProductId};
use std::sync::Arc;
use tracing::error;

use crate::ledger::{Reservation, ReservationLedger, StockLevel};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn ReservationLedger>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockResponse {
    #[serde(flatten)]
    pub level: StockLevel,
    pub available: i32,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/inventory/:product_id", get(get_stock))
        .route("/orders/:order_id/reservations", get(get_reservations))
        .with_state(state)
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "inventory-service",
    })
}

pub async fn get_stock(
    State(state): State<AppState>,
    Path(product_id): Path<ProductId>,
) -> Result<Json<StockResponse>, ApiError> {
    match state.ledger.stock(product_id).await {
        Ok(Some(level)) => Ok(Json(StockResponse {
            available: level.available(),
            level,
        })),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Product {product_id} not found"),
            }),
        )),
        Err(e) => Err(internal_error(e)),
    }
}

pub async fn get_reservations(
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<Vec<Reservation>>, ApiError> {
    state
        .ledger
        .reservations(order_id)
        .await
        .map(Json)
        .map_err(internal_error)
}

fn internal_error(e: anyhow::Error) -> ApiError {
    error!("Ledger query failed: {:#}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Internal server error".to_string(),
        }),
    )
}
