//! Read-only device directory.
//!
//! Devices are registered by another service; the dispatch pipeline only looks
//! them up, by id or by owning user.

use async_trait::async_trait;
use sqlx::PgPool;

use beacon_common::error::AppError;
use beacon_common::types::{Device, NotificationPreferences};

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>, AppError>;

    /// Devices matching `ids`; unknown ids are silently omitted.
    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Device>, AppError>;

    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<Device>, AppError>;
}

#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    id: String,
    user_id: String,
    device_token: String,
    platform: String,
    timezone: Option<String>,
    notification_preferences: Option<serde_json::Value>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        // Unreadable preferences count as missing, which disables delivery.
        let notification_preferences = row.notification_preferences.and_then(|value| {
            serde_json::from_value::<NotificationPreferences>(value)
                .map_err(|e| {
                    tracing::warn!(
                        device_id = %row.id,
                        error = %e,
                        "Malformed notification preferences"
                    );
                })
                .ok()
        });

        Device {
            id: row.id,
            user_id: row.user_id,
            device_token: row.device_token,
            platform: row.platform,
            timezone: row.timezone,
            notification_preferences,
        }
    }
}

/// PostgreSQL-backed [`DeviceDirectory`] over the `devices` table.
#[derive(Clone)]
pub struct PgDeviceDirectory {
    pool: PgPool,
}

impl PgDeviceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const DEVICE_COLUMNS: &str =
    "id, user_id, device_token, platform, timezone, notification_preferences";

#[async_trait]
impl DeviceDirectory for PgDeviceDirectory {
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>, AppError> {
        let row: Option<DeviceRow> =
            sqlx::query_as(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Device::from))
    }

    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Device>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ANY($1) ORDER BY id"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Device::from).collect())
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<Device>, AppError> {
        let rows: Vec<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Device::from).collect())
    }
}
