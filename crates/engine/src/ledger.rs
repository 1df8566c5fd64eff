//! Delivery ledger: append-only record of every delivery attempt.
//!
//! Attempt numbers are assigned per (notification, device) pair: 1 + the
//! highest number already stored. Stores must make that read-then-append safe
//! against concurrent writers for the same pair; the Postgres store relies on
//! the `(notification_id, device_id, attempt_number)` unique key and retries
//! the computation when it loses.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{DeliveryAttempt, DeliveryStatus};

use crate::store::NotificationStore;

/// How many times a Postgres append recomputes its attempt number after
/// losing a race on the same pair.
const MAX_APPEND_RETRIES: u32 = 16;

/// Outcome to append; the store assigns id, attempt number and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttempt {
    pub status: DeliveryStatus,
    pub platform_response: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl NewAttempt {
    pub fn delivered(platform_response: serde_json::Value) -> Self {
        Self {
            status: DeliveryStatus::Delivered,
            platform_response: Some(platform_response),
            error_code: None,
            error_message: None,
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            platform_response: None,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Append an attempt numbered 1 + the highest existing number for the pair.
    async fn append(
        &self,
        notification_id: Uuid,
        device_id: &str,
        attempt: NewAttempt,
    ) -> Result<DeliveryAttempt, AppError>;

    /// All attempts for a notification, oldest first.
    async fn list_for_notification(
        &self,
        notification_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, AppError>;

    /// Whether the device already has a delivered attempt for the notification.
    async fn has_delivered(&self, notification_id: Uuid, device_id: &str)
    -> Result<bool, AppError>;
}

/// PostgreSQL-backed [`AttemptStore`].
#[derive(Clone)]
pub struct PgAttemptStore {
    pool: PgPool,
}

impl PgAttemptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttemptStore for PgAttemptStore {
    async fn append(
        &self,
        notification_id: Uuid,
        device_id: &str,
        attempt: NewAttempt,
    ) -> Result<DeliveryAttempt, AppError> {
        let mut conflicts = 0u32;
        loop {
            let result = sqlx::query_as::<_, DeliveryAttempt>(
                r#"
                INSERT INTO delivery_attempts (
                    id, notification_id, device_id, attempt_number, status,
                    platform_response, error_code, error_message
                )
                SELECT $1, $2, $3, COALESCE(MAX(attempt_number), 0) + 1, $4, $5, $6, $7
                FROM delivery_attempts
                WHERE notification_id = $2 AND device_id = $3
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(notification_id)
            .bind(device_id)
            .bind(attempt.status.to_string())
            .bind(&attempt.platform_response)
            .bind(&attempt.error_code)
            .bind(&attempt.error_message)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => return Ok(row),
                Err(sqlx::Error::Database(db_err))
                    if db_err.is_unique_violation() && conflicts < MAX_APPEND_RETRIES =>
                {
                    conflicts += 1;
                    tracing::debug!(
                        notification_id = %notification_id,
                        device_id,
                        conflicts,
                        "Attempt number taken by a concurrent writer, recomputing"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn list_for_notification(
        &self,
        notification_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        let rows: Vec<DeliveryAttempt> = sqlx::query_as(
            r#"
            SELECT * FROM delivery_attempts
            WHERE notification_id = $1
            ORDER BY attempted_at ASC, attempt_number ASC
            "#,
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn has_delivered(
        &self,
        notification_id: Uuid,
        device_id: &str,
    ) -> Result<bool, AppError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM delivery_attempts
                WHERE notification_id = $1 AND device_id = $2 AND status = 'delivered'
            )
            "#,
        )
        .bind(notification_id)
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}

/// One row of a status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptSummary {
    pub device_id: String,
    pub attempt_number: i32,
    pub status: DeliveryStatus,
    pub error_code: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl From<&DeliveryAttempt> for AttemptSummary {
    fn from(attempt: &DeliveryAttempt) -> Self {
        Self {
            device_id: attempt.device_id.clone(),
            attempt_number: attempt.attempt_number,
            status: attempt.status,
            error_code: attempt.error_code.clone(),
            attempted_at: attempt.attempted_at,
        }
    }
}

/// Aggregate delivery status of a notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub notification_id: Uuid,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub delivery_attempts: Vec<AttemptSummary>,
}

/// Status of a notification derived from its attempts:
/// delivered if any attempt was delivered, failed if every attempt failed,
/// expired if any attempt expired, pending otherwise.
pub fn aggregate_status(attempts: &[DeliveryAttempt]) -> DeliveryStatus {
    if attempts.is_empty() {
        return DeliveryStatus::Pending;
    }

    if attempts
        .iter()
        .any(|a| a.status == DeliveryStatus::Delivered)
    {
        DeliveryStatus::Delivered
    } else if attempts.iter().all(|a| a.status == DeliveryStatus::Failed) {
        DeliveryStatus::Failed
    } else if attempts.iter().any(|a| a.status == DeliveryStatus::Expired) {
        DeliveryStatus::Expired
    } else {
        DeliveryStatus::Pending
    }
}

/// Ledger service: records attempts and answers status queries.
#[derive(Clone)]
pub struct DeliveryLedger {
    attempts: Arc<dyn AttemptStore>,
    notifications: Arc<dyn NotificationStore>,
}

impl DeliveryLedger {
    pub fn new(attempts: Arc<dyn AttemptStore>, notifications: Arc<dyn NotificationStore>) -> Self {
        Self {
            attempts,
            notifications,
        }
    }

    /// Append one attempt for (notification, device).
    pub async fn record_attempt(
        &self,
        notification_id: Uuid,
        device_id: &str,
        status: DeliveryStatus,
        platform_response: Option<serde_json::Value>,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> Result<DeliveryAttempt, AppError> {
        self.record(
            notification_id,
            device_id,
            NewAttempt {
                status,
                platform_response,
                error_code,
                error_message,
            },
        )
        .await
    }

    pub async fn record(
        &self,
        notification_id: Uuid,
        device_id: &str,
        attempt: NewAttempt,
    ) -> Result<DeliveryAttempt, AppError> {
        let recorded = self
            .attempts
            .append(notification_id, device_id, attempt)
            .await?;

        tracing::debug!(
            notification_id = %notification_id,
            device_id,
            attempt_number = recorded.attempt_number,
            status = %recorded.status,
            error_code = recorded.error_code.as_deref().unwrap_or(""),
            "Delivery attempt recorded"
        );

        Ok(recorded)
    }

    pub async fn has_delivered(
        &self,
        notification_id: Uuid,
        device_id: &str,
    ) -> Result<bool, AppError> {
        self.attempts.has_delivered(notification_id, device_id).await
    }

    pub async fn attempts(&self, notification_id: Uuid) -> Result<Vec<DeliveryAttempt>, AppError> {
        self.attempts.list_for_notification(notification_id).await
    }

    /// Aggregate status report for a notification.
    pub async fn get_status(&self, notification_id: Uuid) -> Result<StatusReport, AppError> {
        let notification = self
            .notifications
            .find_by_id(notification_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Notification {} not found", notification_id))
            })?;

        let attempts = self.attempts.list_for_notification(notification_id).await?;

        Ok(StatusReport {
            notification_id,
            status: aggregate_status(&attempts),
            created_at: notification.created_at,
            processed_at: attempts.last().map(|a| a.attempted_at),
            delivery_attempts: attempts.iter().map(AttemptSummary::from).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAttemptStore, MemoryNotificationStore};

    fn attempt(status: DeliveryStatus) -> DeliveryAttempt {
        DeliveryAttempt {
            id: Uuid::new_v4(),
            notification_id: Uuid::nil(),
            device_id: "d1".to_string(),
            attempt_number: 1,
            status,
            platform_response: None,
            error_code: None,
            error_message: None,
            attempted_at: Utc::now(),
        }
    }

    #[test]
    fn test_no_attempts_is_pending() {
        assert_eq!(aggregate_status(&[]), DeliveryStatus::Pending);
    }

    #[test]
    fn test_any_delivered_wins() {
        let attempts = [
            attempt(DeliveryStatus::Failed),
            attempt(DeliveryStatus::Failed),
            attempt(DeliveryStatus::Delivered),
            attempt(DeliveryStatus::Expired),
        ];
        assert_eq!(aggregate_status(&attempts), DeliveryStatus::Delivered);
    }

    #[test]
    fn test_all_failed_is_failed() {
        let attempts = [
            attempt(DeliveryStatus::Failed),
            attempt(DeliveryStatus::Failed),
        ];
        assert_eq!(aggregate_status(&attempts), DeliveryStatus::Failed);
    }

    #[test]
    fn test_expired_among_failures_is_expired() {
        let attempts = [
            attempt(DeliveryStatus::Failed),
            attempt(DeliveryStatus::Expired),
        ];
        assert_eq!(aggregate_status(&attempts), DeliveryStatus::Expired);
    }

    #[test]
    fn test_pending_mixed_with_failed_is_pending() {
        let attempts = [
            attempt(DeliveryStatus::Failed),
            attempt(DeliveryStatus::Pending),
        ];
        assert_eq!(aggregate_status(&attempts), DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn test_get_status_unknown_notification_is_not_found() {
        let ledger = DeliveryLedger::new(
            Arc::new(MemoryAttemptStore::new()),
            Arc::new(MemoryNotificationStore::new()),
        );
        let err = ledger.get_status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_record_attempt_numbers_per_pair() {
        let ledger = DeliveryLedger::new(
            Arc::new(MemoryAttemptStore::new()),
            Arc::new(MemoryNotificationStore::new()),
        );
        let id = Uuid::new_v4();

        let first = ledger
            .record_attempt(id, "a", DeliveryStatus::Failed, None, Some("QUIET_HOURS".into()), None)
            .await
            .unwrap();
        let second = ledger
            .record_attempt(id, "a", DeliveryStatus::Delivered, Some(serde_json::json!({})), None, None)
            .await
            .unwrap();
        let other_device = ledger
            .record_attempt(id, "b", DeliveryStatus::Failed, None, None, None)
            .await
            .unwrap();

        assert_eq!(first.attempt_number, 1);
        assert_eq!(second.attempt_number, 2);
        assert_eq!(other_device.attempt_number, 1);
        assert!(ledger.has_delivered(id, "a").await.unwrap());
        assert!(!ledger.has_delivered(id, "b").await.unwrap());
    }
}
