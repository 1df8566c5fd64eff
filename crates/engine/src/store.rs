//! Notification persistence.
//!
//! Notifications are written once by intake and never updated. The
//! idempotency key is unique; an insert that loses a race against an equal
//! key resolves to the winning row instead of failing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{Notification, NotificationContent, Priority, Recipient};

/// Result of an idempotent insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// The given notification was stored.
    Created(Notification),
    /// Another notification already holds the idempotency key.
    Existing(Notification),
}

impl InsertOutcome {
    pub fn notification(&self) -> &Notification {
        match self {
            InsertOutcome::Created(n) | InsertOutcome::Existing(n) => n,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Notification>, AppError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Notification>, AppError>;

    /// Store `notification` unless its idempotency key is taken.
    async fn insert_if_absent(
        &self,
        notification: &Notification,
    ) -> Result<InsertOutcome, AppError>;

    /// Notifications addressed to a user, newest first.
    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<Notification>, AppError>;
}

/// Flat row shape of the `notifications` table.
#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    external_id: Option<String>,
    user_id: String,
    device_ids: Option<Vec<String>>,
    priority: Priority,
    title: String,
    body: String,
    image_url: Option<String>,
    deep_link: Option<String>,
    content_data: Option<serde_json::Value>,
    data: Option<serde_json::Value>,
    source: String,
    idempotency_key: String,
    ttl_seconds: Option<i64>,
    scheduled_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Notification {
            id: row.id,
            external_id: row.external_id,
            recipient: Recipient {
                user_id: row.user_id,
                device_ids: row.device_ids,
            },
            priority: row.priority,
            content: NotificationContent {
                title: row.title,
                body: row.body,
                image_url: row.image_url,
                deep_link: row.deep_link,
                data: row.content_data,
            },
            data: row.data,
            source: row.source,
            idempotency_key: row.idempotency_key,
            ttl: row.ttl_seconds,
            scheduled_at: row.scheduled_at,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

/// PostgreSQL-backed [`NotificationStore`].
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        let row: Option<NotificationRow> =
            sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Notification::from))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Notification>, AppError> {
        let row: Option<NotificationRow> =
            sqlx::query_as("SELECT * FROM notifications WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Notification::from))
    }

    async fn insert_if_absent(
        &self,
        notification: &Notification,
    ) -> Result<InsertOutcome, AppError> {
        let n = notification;
        let inserted: Option<NotificationRow> = sqlx::query_as(
            r#"
            INSERT INTO notifications (
                id, external_id, user_id, device_ids, priority,
                title, body, image_url, deep_link, content_data,
                data, source, idempotency_key, ttl_seconds, scheduled_at,
                expires_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(n.id)
        .bind(&n.external_id)
        .bind(&n.recipient.user_id)
        .bind(&n.recipient.device_ids)
        .bind(n.priority.to_string())
        .bind(&n.content.title)
        .bind(&n.content.body)
        .bind(&n.content.image_url)
        .bind(&n.content.deep_link)
        .bind(&n.content.data)
        .bind(&n.data)
        .bind(&n.source)
        .bind(&n.idempotency_key)
        .bind(n.ttl)
        .bind(n.scheduled_at)
        .bind(n.expires_at)
        .bind(n.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Created(row.into()));
        }

        // Lost the race on the idempotency key: the winner's row is committed.
        let winner = self
            .find_by_idempotency_key(&n.idempotency_key)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "Idempotency key {} conflicted but no row was found",
                    n.idempotency_key
                ))
            })?;

        Ok(InsertOutcome::Existing(winner))
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<Notification>, AppError> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            "SELECT * FROM notifications WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Notification::from).collect())
    }
}
