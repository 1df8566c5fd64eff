use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use beacon_common::error::AppError;
use beacon_engine::processor::{NotificationProcessor, ProcessOutcome};
use beacon_engine::queue::{FailOutcome, JobQueue, PROCESS_JOB, QueuedJob};
use beacon_engine::retry::RetryOutcome;

use crate::supervisor::RetrySupervisor;

/// Final state of one reserved job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    /// Acknowledged. Carries the processing outcome and any retry scheduled
    /// for the notification.
    Completed {
        outcome: ProcessOutcome,
        retry: Option<RetryOutcome>,
    },
    /// Acknowledged without processing.
    Discarded,
    /// Handed back to the queue after an infrastructure failure.
    Requeued { delay_ms: u64 },
    DeadLettered,
}

/// Queue consumer: reserves jobs and runs them through the processor with
/// bounded concurrency.
#[derive(Clone)]
pub struct JobConsumer {
    queue: Arc<dyn JobQueue>,
    processor: NotificationProcessor,
    supervisor: Option<RetrySupervisor>,
    concurrency: usize,
    poll_interval: Duration,
}

impl JobConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: NotificationProcessor,
        supervisor: Option<RetrySupervisor>,
        concurrency: usize,
        poll_interval_ms: u64,
    ) -> Self {
        Self {
            queue,
            processor,
            supervisor,
            concurrency: concurrency.max(1),
            poll_interval: Duration::from_millis(poll_interval_ms),
        }
    }

    /// Consume until `shutdown` flips to `true`, then wait for in-flight jobs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();

        tracing::info!(
            concurrency = self.concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            retry_supervisor = self.supervisor.is_some(),
            "Job consumer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Reap finished jobs so the set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => permit?,
                _ = shutdown.changed() => break,
            };

            let job = match self.queue.reserve().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to reserve job, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval * 4) => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
            };

            let consumer = self.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                let job_id = job.id;
                if let Err(e) = consumer.handle_job(job).await {
                    tracing::error!(job_id = %job_id, error = %e, "Job could not be settled");
                }
            });
        }

        tracing::info!(in_flight = in_flight.len(), "Shutdown requested, draining jobs");
        while in_flight.join_next().await.is_some() {}
        tracing::info!("Job consumer stopped");

        Ok(())
    }

    /// Run one reserved job and settle it with the queue.
    pub async fn handle_job(&self, job: QueuedJob) -> Result<JobDisposition, AppError> {
        if job.job_type != PROCESS_JOB {
            tracing::warn!(job_id = %job.id, job_type = %job.job_type, "Unknown job type, discarding");
            self.queue.complete(&job).await?;
            return Ok(JobDisposition::Discarded);
        }

        let notification_id = job.payload.notification_id;
        let result = match self.processor.process(notification_id).await {
            Ok(outcome) => self.supervise(outcome).await,
            Err(e) => Err(e),
        };

        match result {
            Ok((outcome, retry)) => {
                self.queue.complete(&job).await?;
                Ok(JobDisposition::Completed { outcome, retry })
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    notification_id = %notification_id,
                    attempts_made = job.attempts_made,
                    error = %e,
                    "Job failed"
                );
                match self.queue.fail(job, &e.to_string()).await? {
                    FailOutcome::Retrying { delay_ms } => Ok(JobDisposition::Requeued { delay_ms }),
                    FailOutcome::DeadLettered => {
                        tracing::error!(
                            notification_id = %notification_id,
                            "Job attempts exhausted, moved to dead letters"
                        );
                        Ok(JobDisposition::DeadLettered)
                    }
                }
            }
        }
    }

    async fn supervise(
        &self,
        outcome: ProcessOutcome,
    ) -> Result<(ProcessOutcome, Option<RetryOutcome>), AppError> {
        let retry = match (&self.supervisor, &outcome) {
            (Some(supervisor), ProcessOutcome::Dispatched(report)) => {
                supervisor.after_run(report).await?
            }
            _ => None,
        };
        Ok((outcome, retry))
    }
}
