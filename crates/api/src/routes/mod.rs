//! Route definitions

pub mod payments;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/payments/webhook/{provider}", post(payments::receive_webhook))
        .route("/payments/checkout", post(payments::initiate_checkout))
        .route(
            "/payments/checkout/cancel",
            post(payments::cancel_checkout),
        )
        .route(
            "/payments/checkout/confirm",
            post(payments::confirm_checkout),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
