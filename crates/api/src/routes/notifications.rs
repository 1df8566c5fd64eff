//! Notification submission and status routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::Notification;
use beacon_engine::intake::{CreateNotificationRequest, SubmitResponse};
use beacon_engine::ledger::StatusReport;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(submit_notification))
        .route("/api/notifications/{id}", get(get_notification))
        .route("/api/notifications/{id}/status", get(notification_status))
        .route("/api/users/{user_id}/notifications", get(user_notifications))
}

/// POST /api/notifications: Accept a notification for dispatch.
///
/// Resubmitting an idempotency key returns the original notification id.
async fn submit_notification(
    State(state): State<AppState>,
    Json(request): Json<CreateNotificationRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let response = state.intake.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /api/notifications/{id}: The stored notification.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Notification>, AppError> {
    let id = parse_id(&id)?;
    let notification = state
        .notifications
        .find_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
    Ok(Json(notification))
}

/// GET /api/notifications/{id}/status: Aggregate delivery status.
async fn notification_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusReport>, AppError> {
    let report = state.ledger.get_status(parse_id(&id)?).await?;
    Ok(Json(report))
}

/// GET /api/users/{user_id}/notifications: Newest first.
async fn user_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let notifications = state.notifications.find_by_user_id(&user_id).await?;
    Ok(Json(notifications))
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    raw.parse()
        .map_err(|_| AppError::Validation(format!("'{}' is not a valid notification id", raw)))
}
