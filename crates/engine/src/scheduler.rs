//! Dispatch scheduler: turns a persisted notification into one queued job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::Notification;

use crate::policy::DispatchPolicy;
use crate::queue::{DispatchJob, JobQueue, PROCESS_JOB};

#[derive(Clone)]
pub struct DispatchScheduler {
    queue: Arc<dyn JobQueue>,
}

impl DispatchScheduler {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    pub async fn enqueue(&self, notification: &Notification) -> Result<Uuid, AppError> {
        self.enqueue_at(notification, Utc::now()).await
    }

    /// Enqueue relative to `now`. A `scheduled_at` in the future becomes a
    /// delayed job; anything else is immediate.
    pub async fn enqueue_at(
        &self,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> Result<Uuid, AppError> {
        let policy = DispatchPolicy::for_priority(notification.priority);
        let delay_ms = schedule_delay_ms(notification.scheduled_at, now);

        let job_id = self
            .queue
            .enqueue(
                PROCESS_JOB,
                DispatchJob {
                    notification_id: notification.id,
                },
                policy.enqueue_options(delay_ms),
            )
            .await?;

        tracing::info!(
            notification_id = %notification.id,
            job_id = %job_id,
            priority = %notification.priority,
            rank = policy.rank,
            delay_ms = delay_ms.unwrap_or(0),
            "Notification queued for dispatch"
        );

        Ok(job_id)
    }
}

fn schedule_delay_ms(scheduled_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u64> {
    let delay = scheduled_at?.signed_duration_since(now).num_milliseconds();
    (delay > 0).then_some(delay as u64)
}
