//! Intake: validates submissions, deduplicates them by idempotency key,
//! persists new notifications and hands them to the dispatch scheduler.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{Notification, NotificationContent, Priority, Recipient};

use crate::scheduler::DispatchScheduler;
use crate::store::{InsertOutcome, NotificationStore};

/// Lifetime of a notification submitted without a ttl.
pub const DEFAULT_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Submission payload. Every field is optional at the wire level so that
/// missing fields surface as validation errors rather than decode failures.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CreateNotificationRequest {
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub recipient: Option<RecipientRequest>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub content: Option<ContentRequest>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Seconds; 0 or absent means 24 hours
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecipientRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub device_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContentRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub deep_link: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitStatus {
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub notification_id: Uuid,
    pub status: SubmitStatus,
}

impl SubmitResponse {
    fn accepted(notification_id: Uuid) -> Self {
        Self {
            notification_id,
            status: SubmitStatus::Accepted,
        }
    }
}

/// Blank values are rejected, but accepted values are kept exactly as sent.
fn required(value: Option<&String>, field: &str) -> Result<String, AppError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.clone()),
        _ => Err(AppError::Validation(format!("{field} is required"))),
    }
}

impl CreateNotificationRequest {
    /// Check the request and build the notification it describes.
    pub fn into_notification(self, now: DateTime<Utc>) -> Result<Notification, AppError> {
        let recipient = self.recipient.unwrap_or_default();
        let user_id = required(recipient.user_id.as_ref(), "recipient.user_id")?;

        if let Some(ids) = &recipient.device_ids {
            if ids.is_empty() {
                return Err(AppError::Validation(
                    "recipient.device_ids must not be empty when present".to_string(),
                ));
            }
            if ids.iter().any(|id| id.trim().is_empty()) {
                return Err(AppError::Validation(
                    "recipient.device_ids must not contain empty ids".to_string(),
                ));
            }
        }

        let content = self.content.unwrap_or_default();
        let title = required(content.title.as_ref(), "content.title")?;
        let body = required(content.body.as_ref(), "content.body")?;

        let priority_label = required(self.priority.as_ref(), "priority")?;
        let priority: Priority = priority_label.trim().parse().map_err(|_| {
            AppError::Validation(format!(
                "priority must be one of critical, high, medium, low (got '{priority_label}')"
            ))
        })?;

        let source = required(self.source.as_ref(), "source")?;
        let idempotency_key = required(self.idempotency_key.as_ref(), "idempotency_key")?;

        let ttl_seconds = match self.ttl {
            Some(ttl) if ttl < 0 => {
                return Err(AppError::Validation("ttl must not be negative".to_string()));
            }
            Some(0) | None => DEFAULT_TTL_SECONDS,
            Some(ttl) => ttl,
        };
        let expires_at = Duration::try_seconds(ttl_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| AppError::Validation("ttl is out of range".to_string()))?;

        Ok(Notification {
            id: Uuid::new_v4(),
            external_id: self.external_id,
            recipient: Recipient {
                user_id,
                device_ids: recipient.device_ids,
            },
            priority,
            content: NotificationContent {
                title,
                body,
                image_url: content.image_url,
                deep_link: content.deep_link,
                data: content.data,
            },
            data: self.data,
            source,
            idempotency_key,
            ttl: self.ttl,
            scheduled_at: self.scheduled_at,
            expires_at,
            created_at: now,
        })
    }
}

#[derive(Clone)]
pub struct IntakeService {
    store: Arc<dyn NotificationStore>,
    scheduler: DispatchScheduler,
}

impl IntakeService {
    pub fn new(store: Arc<dyn NotificationStore>, scheduler: DispatchScheduler) -> Self {
        Self { store, scheduler }
    }

    pub async fn submit(
        &self,
        request: CreateNotificationRequest,
    ) -> Result<SubmitResponse, AppError> {
        self.submit_at(request, Utc::now()).await
    }

    /// Submit with an explicit creation time.
    ///
    /// A request whose idempotency key is already stored resolves to the
    /// stored notification and is neither persisted nor queued again.
    pub async fn submit_at(
        &self,
        request: CreateNotificationRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitResponse, AppError> {
        let notification = request.into_notification(now)?;

        if let Some(existing) = self
            .store
            .find_by_idempotency_key(&notification.idempotency_key)
            .await?
        {
            tracing::info!(
                notification_id = %existing.id,
                idempotency_key = %notification.idempotency_key,
                "Duplicate submission"
            );
            return Ok(SubmitResponse::accepted(existing.id));
        }

        match self.store.insert_if_absent(&notification).await? {
            InsertOutcome::Created(created) => {
                tracing::info!(
                    notification_id = %created.id,
                    user_id = %created.recipient.user_id,
                    priority = %created.priority,
                    source = %created.source,
                    "Notification accepted"
                );
                self.scheduler.enqueue_at(&created, now).await?;
                Ok(SubmitResponse::accepted(created.id))
            }
            InsertOutcome::Existing(winner) => {
                tracing::info!(
                    notification_id = %winner.id,
                    idempotency_key = %notification.idempotency_key,
                    "Lost idempotency race, returning stored notification"
                );
                Ok(SubmitResponse::accepted(winner.id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNotificationStore;
    use crate::queue::MemoryJobQueue;
    use serde_json::json;

    fn request(key: &str) -> CreateNotificationRequest {
        serde_json::from_value(json!({
            "recipient": {"user_id": "user-1"},
            "priority": "HIGH",
            "content": {"title": "Order shipped", "body": "On its way"},
            "source": "orders",
            "idempotency_key": key,
        }))
        .unwrap()
    }

    fn service() -> (IntakeService, Arc<MemoryNotificationStore>, Arc<MemoryJobQueue>) {
        let store = Arc::new(MemoryNotificationStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let intake = IntakeService::new(store.clone(), DispatchScheduler::new(queue.clone()));
        (intake, store, queue)
    }

    fn validation_message(err: AppError) -> String {
        match err {
            AppError::Validation(msg) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_is_idempotent() {
        let (intake, store, queue) = service();

        let first = intake.submit(request("k1")).await.unwrap();
        let second = intake.submit(request("k1")).await.unwrap();

        assert_eq!(first.notification_id, second.notification_id);
        assert_eq!(second.status, SubmitStatus::Accepted);
        assert_eq!(store.len().await, 1);
        assert_eq!(queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn test_keys_differing_in_whitespace_are_distinct() {
        let (intake, store, queue) = service();

        let mut first = request("k1");
        first.content.as_mut().unwrap().title = Some("  Hi  ".into());
        let mut second = request(" k1 ");
        second.content.as_mut().unwrap().title = Some("Other".into());

        let a = intake.submit(first).await.unwrap();
        let b = intake.submit(second).await.unwrap();

        assert_ne!(a.notification_id, b.notification_id);
        assert_eq!(store.len().await, 2);
        assert_eq!(queue.ready_len().await, 2);

        let stored = store.find_by_id(a.notification_id).await.unwrap().unwrap();
        assert_eq!(stored.idempotency_key, "k1");
        assert_eq!(stored.content.title, "  Hi  ");
        let stored = store.find_by_id(b.notification_id).await.unwrap().unwrap();
        assert_eq!(stored.idempotency_key, " k1 ");
        assert_eq!(stored.content.title, "Other");
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_submits_create_one() {
        let (intake, store, queue) = service();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let intake = intake.clone();
            handles.push(tokio::spawn(async move {
                intake.submit(request("race")).await.unwrap().notification_id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.len().await, 1);
        assert_eq!(queue.ready_len().await, 1);
    }

    #[test]
    fn test_default_and_zero_ttl() {
        let now = Utc::now();
        let n = request("a").into_notification(now).unwrap();
        assert_eq!(n.expires_at, now + Duration::hours(24));

        let mut zero = request("b");
        zero.ttl = Some(0);
        let n = zero.into_notification(now).unwrap();
        assert_eq!(n.expires_at, now + Duration::hours(24));
        assert_eq!(n.ttl, Some(0));

        let mut short = request("c");
        short.ttl = Some(60);
        let n = short.into_notification(now).unwrap();
        assert_eq!(n.expires_at, now + Duration::seconds(60));
    }

    #[test]
    fn test_validation_errors() {
        let now = Utc::now();

        let mut r = request("k");
        r.recipient = None;
        assert!(validation_message(r.into_notification(now).unwrap_err()).contains("user_id"));

        let mut r = request("k");
        r.content.as_mut().unwrap().title = Some("  ".into());
        assert!(validation_message(r.into_notification(now).unwrap_err()).contains("title"));

        let mut r = request("k");
        r.priority = Some("urgent".into());
        assert!(validation_message(r.into_notification(now).unwrap_err()).contains("priority"));

        let mut r = request("k");
        r.idempotency_key = None;
        assert!(
            validation_message(r.into_notification(now).unwrap_err()).contains("idempotency_key")
        );

        let mut r = request("k");
        r.source = None;
        assert!(validation_message(r.into_notification(now).unwrap_err()).contains("source"));

        let mut r = request("k");
        r.ttl = Some(-1);
        assert!(validation_message(r.into_notification(now).unwrap_err()).contains("ttl"));

        let mut r = request("k");
        r.recipient.as_mut().unwrap().device_ids = Some(vec![]);
        assert!(validation_message(r.into_notification(now).unwrap_err()).contains("device_ids"));
    }

    #[tokio::test]
    async fn test_invalid_request_writes_nothing() {
        let (intake, store, queue) = service();
        let mut r = request("k");
        r.priority = None;

        assert!(intake.submit(r).await.is_err());
        assert!(store.is_empty().await);
        assert_eq!(queue.ready_len().await, 0);
    }
}
