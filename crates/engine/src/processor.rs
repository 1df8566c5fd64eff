//! Notification processor: runs one dispatch job.
//!
//! For a job `{notification_id}` the processor:
//! 1. Loads the notification (missing → dropped, the job is acknowledged)
//! 2. Stops when the notification has expired
//! 3. Resolves target devices (explicit ids, else every device of the user)
//! 4. Per device, in its own task: preference gate → quiet-hours gate →
//!    platform adapter, recording exactly one ledger row per device
//!
//! Storage failures in steps 1–3 are returned so the queue retries the job.
//! Anything that goes wrong inside a device task, panics included, is recorded
//! as `PROCESSING_ERROR` for that device only.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use uuid::Uuid;

use beacon_common::delivery::AdapterRegistry;
use beacon_common::error::AppError;
use beacon_common::types::{Device, Notification, Platform, Priority};

use crate::directory::DeviceDirectory;
use crate::ledger::{DeliveryLedger, NewAttempt};
use crate::quiet_hours::is_in_quiet_hours;
use crate::store::NotificationStore;

/// Error codes recorded by the processor itself.
pub mod codes {
    pub const NOTIFICATIONS_DISABLED: &str = "NOTIFICATIONS_DISABLED";
    pub const QUIET_HOURS: &str = "QUIET_HOURS";
    pub const UNKNOWN_PLATFORM: &str = "UNKNOWN_PLATFORM";
    pub const PROCESSING_ERROR: &str = "PROCESSING_ERROR";

    /// Failures that will not change on a later attempt.
    pub fn is_permanent(code: &str) -> bool {
        matches!(code, NOTIFICATIONS_DISABLED | UNKNOWN_PLATFORM)
    }
}

/// What happened to one device during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceResult {
    Delivered { attempt_number: i32 },
    Failed { attempt_number: i32, code: String },
    /// The device already had a delivered attempt; nothing was recorded.
    AlreadyDelivered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOutcome {
    pub device_id: String,
    pub result: DeviceResult,
}

/// Per-device results of one dispatch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub notification_id: Uuid,
    pub priority: Priority,
    pub outcomes: Vec<DeviceOutcome>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.result,
                    DeviceResult::Delivered { .. } | DeviceResult::AlreadyDelivered
                )
            })
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, DeviceResult::Failed { .. }))
            .count()
    }

    /// Highest attempt number among failures worth retrying, if any.
    pub fn retryable_attempt(&self) -> Option<u32> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.result {
                DeviceResult::Failed {
                    attempt_number,
                    code,
                } if !codes::is_permanent(code) => u32::try_from(*attempt_number).ok(),
                _ => None,
            })
            .max()
    }
}

/// Result of processing one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The notification does not exist.
    Dropped,
    /// The notification expired before it could be dispatched.
    Expired,
    /// No device matched the recipient.
    NoDevices,
    Dispatched(DispatchReport),
}

#[derive(Clone)]
pub struct NotificationProcessor {
    notifications: Arc<dyn NotificationStore>,
    devices: Arc<dyn DeviceDirectory>,
    ledger: DeliveryLedger,
    adapters: AdapterRegistry,
}

impl NotificationProcessor {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        devices: Arc<dyn DeviceDirectory>,
        ledger: DeliveryLedger,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            notifications,
            devices,
            ledger,
            adapters,
        }
    }

    pub async fn process(&self, notification_id: Uuid) -> Result<ProcessOutcome, AppError> {
        self.process_at(notification_id, Utc::now()).await
    }

    /// Process with an explicit clock, used for expiry and quiet hours.
    pub async fn process_at(
        &self,
        notification_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, AppError> {
        let Some(notification) = self.notifications.find_by_id(notification_id).await? else {
            tracing::error!(
                notification_id = %notification_id,
                "Notification not found, dropping job"
            );
            return Ok(ProcessOutcome::Dropped);
        };

        if notification.is_expired_at(now) {
            tracing::info!(
                notification_id = %notification_id,
                expires_at = %notification.expires_at,
                "Notification expired before dispatch"
            );
            return Ok(ProcessOutcome::Expired);
        }

        let devices = self.resolve_devices(&notification).await?;
        if devices.is_empty() {
            tracing::info!(
                notification_id = %notification_id,
                user_id = %notification.recipient.user_id,
                "No devices to dispatch to"
            );
            return Ok(ProcessOutcome::NoDevices);
        }

        let notification = Arc::new(notification);
        let mut tasks = JoinSet::new();
        // Task id → device id, so failed or panicked tasks can be attributed.
        let mut task_devices = HashMap::new();
        for device in devices {
            let this = self.clone();
            let notification = notification.clone();
            let device_id = device.id.clone();
            let handle =
                tasks.spawn(async move { this.deliver(&notification, &device, now).await });
            task_devices.insert(handle.id(), device_id);
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut first_error = None;

        while let Some(joined) = tasks.join_next_with_id().await {
            let (device_id, failure) = match joined {
                Ok((_, Ok(outcome))) => {
                    outcomes.push(outcome);
                    continue;
                }
                Ok((task_id, Err(e))) => (task_devices.remove(&task_id), e.to_string()),
                Err(join_err) => (
                    task_devices.remove(&join_err.id()),
                    format!("device task aborted: {join_err}"),
                ),
            };

            let Some(device_id) = device_id else {
                tracing::error!(
                    notification_id = %notification_id,
                    error = %failure,
                    "Device task failed and could not be attributed"
                );
                continue;
            };

            tracing::error!(
                notification_id = %notification_id,
                device_id = %device_id,
                error = %failure,
                "Device processing failed"
            );

            match self
                .ledger
                .record(
                    notification_id,
                    &device_id,
                    NewAttempt::failed(codes::PROCESSING_ERROR, failure),
                )
                .await
            {
                Ok(attempt) => outcomes.push(DeviceOutcome {
                    device_id,
                    result: DeviceResult::Failed {
                        attempt_number: attempt.attempt_number,
                        code: codes::PROCESSING_ERROR.to_string(),
                    },
                }),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        outcomes.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        let report = DispatchReport {
            notification_id,
            priority: notification.priority,
            outcomes,
        };

        tracing::info!(
            notification_id = %notification_id,
            devices = report.outcomes.len(),
            delivered = report.delivered(),
            failed = report.failed(),
            "Dispatch run finished"
        );

        Ok(ProcessOutcome::Dispatched(report))
    }

    async fn resolve_devices(&self, notification: &Notification) -> Result<Vec<Device>, AppError> {
        match &notification.recipient.device_ids {
            Some(ids) => self.devices.find_by_ids(ids).await,
            None => {
                self.devices
                    .find_by_user_id(&notification.recipient.user_id)
                    .await
            }
        }
    }

    /// Gate and deliver to one device, recording the outcome.
    async fn deliver(
        &self,
        notification: &Notification,
        device: &Device,
        now: DateTime<Utc>,
    ) -> Result<DeviceOutcome, AppError> {
        if self.ledger.has_delivered(notification.id, &device.id).await? {
            tracing::debug!(
                notification_id = %notification.id,
                device_id = %device.id,
                "Already delivered, skipping"
            );
            return Ok(DeviceOutcome {
                device_id: device.id.clone(),
                result: DeviceResult::AlreadyDelivered,
            });
        }

        let attempt = self.attempt_for(notification, device, now).await;
        let recorded = self.ledger.record(notification.id, &device.id, attempt).await?;

        let result = match recorded.error_code {
            None => DeviceResult::Delivered {
                attempt_number: recorded.attempt_number,
            },
            Some(code) => DeviceResult::Failed {
                attempt_number: recorded.attempt_number,
                code,
            },
        };

        Ok(DeviceOutcome {
            device_id: device.id.clone(),
            result,
        })
    }

    async fn attempt_for(
        &self,
        notification: &Notification,
        device: &Device,
        now: DateTime<Utc>,
    ) -> NewAttempt {
        if !device.notifications_enabled() {
            return NewAttempt::failed(
                codes::NOTIFICATIONS_DISABLED,
                "Notifications are disabled for this device",
            );
        }

        if is_in_quiet_hours(now, device) {
            return NewAttempt::failed(codes::QUIET_HOURS, "Device is in quiet hours");
        }

        let Some(adapter) = Platform::parse(&device.platform).and_then(|p| self.adapters.get(p))
        else {
            return NewAttempt::failed(
                codes::UNKNOWN_PLATFORM,
                format!("No delivery adapter for platform '{}'", device.platform),
            );
        };

        match adapter.send(device, &notification.content).await {
            Ok(response) => NewAttempt::delivered(response),
            Err(e) => {
                tracing::warn!(
                    notification_id = %notification.id,
                    device_id = %device.id,
                    code = %e.code,
                    error = %e.message,
                    "Delivery adapter failed"
                );
                NewAttempt::failed(e.code, e.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    use beacon_common::delivery::DeliveryAdapter;
    use beacon_common::error::DeliveryError;
    use beacon_common::types::{
        DeliveryStatus, NotificationContent, NotificationPreferences, QuietHours, Recipient,
    };

    use super::*;
    use crate::memory::{MemoryAttemptStore, MemoryDeviceDirectory, MemoryNotificationStore};

    enum Behaviour {
        Deliver,
        Fail,
        Panic,
    }

    struct StubAdapter {
        platform: Platform,
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl StubAdapter {
        fn new(platform: Platform, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                platform,
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeliveryAdapter for StubAdapter {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn send(
            &self,
            device: &Device,
            _content: &NotificationContent,
        ) -> Result<serde_json::Value, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Deliver => Ok(serde_json::json!({"message_id": device.id})),
                Behaviour::Fail => Err(DeliveryError::new("FCM_ERROR", "UNAVAILABLE")),
                Behaviour::Panic => panic!("adapter blew up"),
            }
        }
    }

    struct Harness {
        processor: NotificationProcessor,
        store: Arc<MemoryNotificationStore>,
        attempts: Arc<MemoryAttemptStore>,
    }

    fn harness(devices: Vec<Device>, adapters: AdapterRegistry) -> Harness {
        let store = Arc::new(MemoryNotificationStore::new());
        let attempts = Arc::new(MemoryAttemptStore::new());
        let ledger = DeliveryLedger::new(attempts.clone(), store.clone());
        let processor = NotificationProcessor::new(
            store.clone(),
            Arc::new(MemoryDeviceDirectory::with_devices(devices)),
            ledger,
            adapters,
        );
        Harness {
            processor,
            store,
            attempts,
        }
    }

    fn device(id: &str, platform: &str) -> Device {
        Device {
            id: id.into(),
            user_id: "user-1".into(),
            device_token: format!("token-{id}"),
            platform: platform.into(),
            timezone: None,
            notification_preferences: Some(NotificationPreferences::default()),
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn notification(created_at: DateTime<Utc>) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            external_id: None,
            recipient: Recipient {
                user_id: "user-1".into(),
                device_ids: None,
            },
            priority: Priority::High,
            content: NotificationContent {
                title: "Hello".into(),
                body: "World".into(),
                image_url: None,
                deep_link: None,
                data: None,
            },
            data: None,
            source: "test".into(),
            idempotency_key: Uuid::new_v4().to_string(),
            ttl: None,
            scheduled_at: None,
            expires_at: created_at + Duration::hours(24),
            created_at,
        }
    }

    async fn stored(h: &Harness, n: Notification) -> Uuid {
        h.store.insert_if_absent(&n).await.unwrap().notification().id
    }

    fn report(outcome: ProcessOutcome) -> DispatchReport {
        match outcome {
            ProcessOutcome::Dispatched(report) => report,
            other => panic!("expected a dispatch report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_notification_is_dropped() {
        let h = harness(vec![], AdapterRegistry::new());
        let outcome = h.processor.process(Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_expired_notification_records_nothing() {
        let android = StubAdapter::new(Platform::Android, Behaviour::Deliver);
        let h = harness(
            vec![device("a", "android")],
            AdapterRegistry::new().with(android.clone()),
        );
        let id = stored(&h, notification(noon())).await;

        let outcome = h
            .processor
            .process_at(id, noon() + Duration::hours(25))
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Expired);
        assert!(h.attempts.all().await.is_empty());
        assert_eq!(android.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_devices() {
        let h = harness(vec![], AdapterRegistry::new());
        let id = stored(&h, notification(noon())).await;

        let outcome = h.processor.process_at(id, noon()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::NoDevices);
    }

    #[tokio::test]
    async fn test_disabled_device_gets_one_row_and_no_send() {
        let android = StubAdapter::new(Platform::Android, Behaviour::Deliver);
        let mut disabled = device("a", "android");
        disabled.notification_preferences = Some(NotificationPreferences {
            enabled: false,
            ..Default::default()
        });
        let h = harness(vec![disabled], AdapterRegistry::new().with(android.clone()));
        let id = stored(&h, notification(noon())).await;

        let report = report(h.processor.process_at(id, noon()).await.unwrap());

        let rows = h.attempts.all().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DeliveryStatus::Failed);
        assert_eq!(rows[0].error_code.as_deref(), Some(codes::NOTIFICATIONS_DISABLED));
        assert_eq!(android.calls(), 0);
        assert_eq!(report.retryable_attempt(), None);
    }

    #[tokio::test]
    async fn test_missing_preferences_count_as_disabled() {
        let mut bare = device("a", "android");
        bare.notification_preferences = None;
        let h = harness(vec![bare], AdapterRegistry::new());
        let id = stored(&h, notification(noon())).await;

        h.processor.process_at(id, noon()).await.unwrap();

        let rows = h.attempts.all().await;
        assert_eq!(rows[0].error_code.as_deref(), Some(codes::NOTIFICATIONS_DISABLED));
    }

    #[tokio::test]
    async fn test_quiet_hours_defer_delivery() {
        let android = StubAdapter::new(Platform::Android, Behaviour::Deliver);
        let mut sleeping = device("a", "android");
        sleeping.notification_preferences = Some(NotificationPreferences {
            quiet_hours: Some(QuietHours {
                enabled: true,
                start: Some("11:00".into()),
                end: Some("13:00".into()),
                timezone: Some("UTC".into()),
            }),
            ..Default::default()
        });
        let h = harness(vec![sleeping], AdapterRegistry::new().with(android.clone()));
        let id = stored(&h, notification(noon())).await;

        let report = report(h.processor.process_at(id, noon()).await.unwrap());
        assert_eq!(android.calls(), 0);
        assert_eq!(report.retryable_attempt(), Some(1));

        // Outside the window the retry goes through as attempt 2.
        let report = report_of(&h, id, noon() + Duration::hours(2)).await;
        assert_eq!(android.calls(), 1);
        assert_eq!(
            report.outcomes[0].result,
            DeviceResult::Delivered { attempt_number: 2 }
        );
    }

    async fn report_of(h: &Harness, id: Uuid, now: DateTime<Utc>) -> DispatchReport {
        report(h.processor.process_at(id, now).await.unwrap())
    }

    #[tokio::test]
    async fn test_unknown_platform() {
        let h = harness(
            vec![device("w", "windows"), device("i", "ios")],
            AdapterRegistry::new().with(StubAdapter::new(Platform::Android, Behaviour::Deliver)),
        );
        let id = stored(&h, notification(noon())).await;

        let report = report_of(&h, id, noon()).await;

        // "ios" is known but has no adapter registered
        assert_eq!(report.failed(), 2);
        for row in h.attempts.all().await {
            assert_eq!(row.error_code.as_deref(), Some(codes::UNKNOWN_PLATFORM));
        }
        assert_eq!(report.retryable_attempt(), None);
    }

    #[tokio::test]
    async fn test_adapter_error_is_recorded_with_its_code() {
        let h = harness(
            vec![device("a", "android")],
            AdapterRegistry::new().with(StubAdapter::new(Platform::Android, Behaviour::Fail)),
        );
        let id = stored(&h, notification(noon())).await;

        let report = report_of(&h, id, noon()).await;

        let rows = h.attempts.all().await;
        assert_eq!(rows[0].error_code.as_deref(), Some("FCM_ERROR"));
        assert_eq!(rows[0].error_message.as_deref(), Some("UNAVAILABLE"));
        assert_eq!(report.retryable_attempt(), Some(1));
    }

    #[tokio::test]
    async fn test_panicking_adapter_is_isolated() {
        let android = StubAdapter::new(Platform::Android, Behaviour::Deliver);
        let ios = StubAdapter::new(Platform::Ios, Behaviour::Panic);
        let h = harness(
            vec![device("a", "android"), device("b", "ios")],
            AdapterRegistry::new().with(android.clone()).with(ios),
        );
        let id = stored(&h, notification(noon())).await;

        let report = report_of(&h, id, noon()).await;

        assert_eq!(
            report.outcomes,
            vec![
                DeviceOutcome {
                    device_id: "a".into(),
                    result: DeviceResult::Delivered { attempt_number: 1 },
                },
                DeviceOutcome {
                    device_id: "b".into(),
                    result: DeviceResult::Failed {
                        attempt_number: 1,
                        code: codes::PROCESSING_ERROR.into(),
                    },
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_delivered_device_is_not_sent_again() {
        let android = StubAdapter::new(Platform::Android, Behaviour::Deliver);
        let h = harness(
            vec![device("a", "android")],
            AdapterRegistry::new().with(android.clone()),
        );
        let id = stored(&h, notification(noon())).await;

        report_of(&h, id, noon()).await;
        let rerun = report_of(&h, id, noon()).await;

        assert_eq!(android.calls(), 1);
        assert_eq!(h.attempts.all().await.len(), 1);
        assert_eq!(rerun.outcomes[0].result, DeviceResult::AlreadyDelivered);
    }

    #[tokio::test]
    async fn test_explicit_device_ids_limit_targets() {
        let android = StubAdapter::new(Platform::Android, Behaviour::Deliver);
        let h = harness(
            vec![device("a", "android"), device("b", "android")],
            AdapterRegistry::new().with(android.clone()),
        );
        let mut n = notification(noon());
        n.recipient.device_ids = Some(vec!["b".into(), "ghost".into()]);
        let id = stored(&h, n).await;

        let report = report_of(&h, id, noon()).await;

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].device_id, "b");
        assert_eq!(android.calls(), 1);
    }
}
