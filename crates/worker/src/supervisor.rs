//! Retry supervisor: decides after each dispatch run whether the
//! notification goes back on the queue.
//!
//! A run is retried when at least one device failed for a reason that may
//! clear up later (adapter error, quiet hours, processing error). The highest
//! attempt number among those devices is checked against the priority's
//! attempt budget.

use beacon_common::error::AppError;
use beacon_engine::processor::DispatchReport;
use beacon_engine::retry::{RetryCoordinator, RetryOutcome, should_retry};

#[derive(Clone)]
pub struct RetrySupervisor {
    coordinator: RetryCoordinator,
}

impl RetrySupervisor {
    pub fn new(coordinator: RetryCoordinator) -> Self {
        Self { coordinator }
    }

    /// Returns `None` when nothing in the run is worth retrying.
    pub async fn after_run(
        &self,
        report: &DispatchReport,
    ) -> Result<Option<RetryOutcome>, AppError> {
        let Some(attempt) = report.retryable_attempt() else {
            return Ok(None);
        };

        if !should_retry(report.priority, attempt) {
            tracing::warn!(
                notification_id = %report.notification_id,
                priority = %report.priority,
                attempt,
                "Delivery retries exhausted, giving up"
            );
            return Ok(Some(RetryOutcome::Exhausted));
        }

        let outcome = self
            .coordinator
            .schedule_retry(report.notification_id, report.priority, attempt)
            .await?;

        Ok(Some(outcome))
    }
}
