//! Retry coordinator: exponential backoff with jitter between dispatch runs.

use std::sync::Arc;

use rand::RngExt;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::Priority;

use crate::policy::DispatchPolicy;
use crate::queue::{DispatchJob, JobQueue, PROCESS_JOB};

/// Upper bound of the random jitter, as a fraction of the backoff delay.
pub const MAX_JITTER_FRACTION: f64 = 0.3;

/// Result of [`RetryCoordinator::schedule_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled { job_id: Uuid, delay_ms: u64 },
    /// The priority's attempt budget is used up; nothing was enqueued.
    Exhausted,
}

/// `true` while `attempt_number` is below the priority's attempt budget.
pub fn should_retry(priority: Priority, attempt_number: u32) -> bool {
    attempt_number < DispatchPolicy::for_priority(priority).max_attempts
}

/// `floor(base * 2^(attempt-1) * (1 + jitter_fraction))`.
pub fn backoff_delay_ms(policy: &DispatchPolicy, attempt_number: u32, jitter_fraction: f64) -> u64 {
    let exponent = attempt_number.max(1) - 1;
    let delay = policy
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(exponent));
    let jitter = (delay as f64 * jitter_fraction.clamp(0.0, 1.0)).floor() as u64;
    delay.saturating_add(jitter)
}

#[derive(Clone)]
pub struct RetryCoordinator {
    queue: Arc<dyn JobQueue>,
}

impl RetryCoordinator {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Re-enqueue the notification after the backoff for `attempt_number`.
    /// The new job may run at most `max_attempts - attempt_number` times.
    pub async fn schedule_retry(
        &self,
        notification_id: Uuid,
        priority: Priority,
        attempt_number: u32,
    ) -> Result<RetryOutcome, AppError> {
        let policy = DispatchPolicy::for_priority(priority);
        if attempt_number >= policy.max_attempts {
            tracing::info!(
                notification_id = %notification_id,
                attempt_number,
                max_attempts = policy.max_attempts,
                "Retry budget exhausted"
            );
            return Ok(RetryOutcome::Exhausted);
        }

        let jitter_fraction = rand::rng().random_range(0.0..MAX_JITTER_FRACTION);
        let delay_ms = backoff_delay_ms(&policy, attempt_number, jitter_fraction);

        let mut options = policy.enqueue_options(Some(delay_ms));
        options.max_attempts = policy.max_attempts - attempt_number;

        let job_id = self
            .queue
            .enqueue(PROCESS_JOB, DispatchJob { notification_id }, options)
            .await?;

        tracing::info!(
            notification_id = %notification_id,
            job_id = %job_id,
            attempt_number,
            delay_ms,
            "Retry scheduled"
        );

        Ok(RetryOutcome::Scheduled { job_id, delay_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryJobQueue;

    #[test]
    fn test_should_retry_uses_budget() {
        assert!(should_retry(Priority::Low, 2));
        assert!(!should_retry(Priority::Low, 3));
        assert!(should_retry(Priority::Critical, 9));
        assert!(!should_retry(Priority::Critical, 10));
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = DispatchPolicy::for_priority(Priority::High);
        assert_eq!(backoff_delay_ms(&policy, 1, 0.0), 30_000);
        assert_eq!(backoff_delay_ms(&policy, 2, 0.0), 60_000);
        assert_eq!(backoff_delay_ms(&policy, 4, 0.0), 240_000);
    }

    #[test]
    fn test_critical_first_retry_bounds() {
        let policy = DispatchPolicy::for_priority(Priority::Critical);
        assert_eq!(backoff_delay_ms(&policy, 1, 0.0), 10_000);
        assert_eq!(backoff_delay_ms(&policy, 1, MAX_JITTER_FRACTION), 13_000);

        for _ in 0..100 {
            let fraction = rand::rng().random_range(0.0..MAX_JITTER_FRACTION);
            let delay = backoff_delay_ms(&policy, 1, fraction);
            assert!((10_000..=13_000).contains(&delay), "{delay}");
        }
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = DispatchPolicy::for_priority(Priority::Low);
        assert_eq!(backoff_delay_ms(&policy, 200, 0.0), u64::MAX);
    }

    #[tokio::test]
    async fn test_schedule_retry_enqueues_delayed_job() {
        let queue = Arc::new(MemoryJobQueue::new());
        let coordinator = RetryCoordinator::new(queue.clone());
        let id = Uuid::new_v4();

        let outcome = coordinator
            .schedule_retry(id, Priority::Medium, 2)
            .await
            .unwrap();

        let RetryOutcome::Scheduled { delay_ms, .. } = outcome else {
            panic!("expected a scheduled retry, got {outcome:?}");
        };
        assert!((240_000..=312_000).contains(&delay_ms));
        assert_eq!(queue.delayed_len().await, 1);

        queue.release_delayed().await;
        let job = queue.reserve().await.unwrap().unwrap();
        assert_eq!(job.payload.notification_id, id);
        assert_eq!(job.options.max_attempts, 3);
        assert_eq!(job.options.priority_rank, 3);
    }

    #[tokio::test]
    async fn test_schedule_retry_exhausted() {
        let queue = Arc::new(MemoryJobQueue::new());
        let coordinator = RetryCoordinator::new(queue.clone());

        let outcome = coordinator
            .schedule_retry(Uuid::new_v4(), Priority::Low, 3)
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::Exhausted);
        assert_eq!(queue.delayed_len().await, 0);
    }
}
