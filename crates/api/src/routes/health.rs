//! Health check endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use beacon_common::redis_pool;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let queue = match &state.redis {
        None => "not_configured",
        Some(redis) => match redis_pool::ping(redis).await {
            Ok(()) => "ok",
            Err(e) => {
                tracing::warn!(error = %e, "Queue health probe failed");
                "unavailable"
            }
        },
    };

    let status = if queue == "unavailable" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(json!({
            "status": if status.is_success() { "ok" } else { "degraded" },
            "service": "beacon-api",
            "version": env!("CARGO_PKG_VERSION"),
            "queue": queue,
        })),
    )
}
