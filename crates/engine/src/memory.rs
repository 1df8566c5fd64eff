//! In-memory store backends.
//!
//! Same contracts as the Postgres stores, kept in process memory. Used by the
//! test suites and by single-process runs without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{DeliveryAttempt, DeliveryStatus, Device, Notification};

use crate::directory::DeviceDirectory;
use crate::ledger::{AttemptStore, NewAttempt};
use crate::store::{InsertOutcome, NotificationStore};

#[derive(Default)]
struct NotificationTable {
    by_id: HashMap<Uuid, Notification>,
    by_key: HashMap<String, Uuid>,
}

/// In-memory [`NotificationStore`].
#[derive(Default)]
pub struct MemoryNotificationStore {
    table: RwLock<NotificationTable>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        Ok(self.table.read().await.by_id.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Notification>, AppError> {
        let table = self.table.read().await;
        Ok(table
            .by_key
            .get(key)
            .and_then(|id| table.by_id.get(id))
            .cloned())
    }

    async fn insert_if_absent(
        &self,
        notification: &Notification,
    ) -> Result<InsertOutcome, AppError> {
        let mut table = self.table.write().await;

        if let Some(existing) = table
            .by_key
            .get(&notification.idempotency_key)
            .and_then(|id| table.by_id.get(id))
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        table
            .by_key
            .insert(notification.idempotency_key.clone(), notification.id);
        table.by_id.insert(notification.id, notification.clone());

        Ok(InsertOutcome::Created(notification.clone()))
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<Notification>, AppError> {
        let mut found: Vec<Notification> = self
            .table
            .read()
            .await
            .by_id
            .values()
            .filter(|n| n.recipient.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }
}

/// In-memory [`AttemptStore`]. Appends are serialized by one lock, so attempt
/// numbers stay gap-free under concurrent writers.
#[derive(Default)]
pub struct MemoryAttemptStore {
    rows: Mutex<Vec<DeliveryAttempt>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored attempt, in append order.
    pub async fn all(&self) -> Vec<DeliveryAttempt> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn append(
        &self,
        notification_id: Uuid,
        device_id: &str,
        attempt: NewAttempt,
    ) -> Result<DeliveryAttempt, AppError> {
        let mut rows = self.rows.lock().await;

        let last = rows
            .iter()
            .filter(|a| a.notification_id == notification_id && a.device_id == device_id)
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(0);

        let row = DeliveryAttempt {
            id: Uuid::new_v4(),
            notification_id,
            device_id: device_id.to_string(),
            attempt_number: last + 1,
            status: attempt.status,
            platform_response: attempt.platform_response,
            error_code: attempt.error_code,
            error_message: attempt.error_message,
            attempted_at: Utc::now(),
        };
        rows.push(row.clone());

        Ok(row)
    }

    async fn list_for_notification(
        &self,
        notification_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|a| a.notification_id == notification_id)
            .cloned()
            .collect())
    }

    async fn has_delivered(
        &self,
        notification_id: Uuid,
        device_id: &str,
    ) -> Result<bool, AppError> {
        Ok(self.rows.lock().await.iter().any(|a| {
            a.notification_id == notification_id
                && a.device_id == device_id
                && a.status == DeliveryStatus::Delivered
        }))
    }
}

/// In-memory [`DeviceDirectory`], insertion ordered.
#[derive(Default)]
pub struct MemoryDeviceDirectory {
    devices: RwLock<Vec<Device>>,
}

impl MemoryDeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        Self {
            devices: RwLock::new(devices.into_iter().collect()),
        }
    }

    /// Add a device, replacing one with the same id.
    pub async fn upsert(&self, device: Device) {
        let mut devices = self.devices.write().await;
        match devices.iter_mut().find(|d| d.id == device.id) {
            Some(slot) => *slot = device,
            None => devices.push(device),
        }
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDeviceDirectory {
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>, AppError> {
        Ok(self
            .devices
            .read()
            .await
            .iter()
            .find(|d| d.id == id)
            .cloned())
    }

    async fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Device>, AppError> {
        Ok(self
            .devices
            .read()
            .await
            .iter()
            .filter(|d| ids.contains(&d.id))
            .cloned()
            .collect())
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Vec<Device>, AppError> {
        Ok(self
            .devices
            .read()
            .await
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_appends_are_gap_free() {
        let store = Arc::new(MemoryAttemptStore::new());
        let notification_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(notification_id, "device-1", NewAttempt::failed("X", "boom"))
                    .await
                    .unwrap()
                    .attempt_number
            }));
        }

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort_unstable();

        assert_eq!(numbers, (1..=10).collect::<Vec<i32>>());
    }

    #[tokio::test]
    async fn test_device_directory_lookups() {
        let device = |id: &str, user: &str| Device {
            id: id.into(),
            user_id: user.into(),
            device_token: format!("tok-{id}"),
            platform: "android".into(),
            timezone: None,
            notification_preferences: None,
        };
        let directory = MemoryDeviceDirectory::with_devices([
            device("a", "u1"),
            device("b", "u1"),
            device("c", "u2"),
        ]);

        assert_eq!(directory.find_by_user_id("u1").await.unwrap().len(), 2);
        let picked = directory
            .find_by_ids(&["c".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "c");
        assert!(directory.find_by_id("missing").await.unwrap().is_none());
    }
}
