//! Job queue contract and backends.
//!
//! Jobs carry a `{notification_id}` payload. Ready jobs are served by
//! ascending priority rank, FIFO within a rank. Delayed jobs become ready once
//! their delay elapses. A reserved job must be completed or failed; failing it
//! schedules a crash retry with the job's own backoff until its attempt budget
//! runs out, after which it is moved to the dead-letter list.

mod memory;
mod redis_backed;

pub use self::memory::MemoryJobQueue;
pub use self::redis_backed::{RedisJobQueue, STALLED_ERROR};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_common::error::AppError;

/// Job type for dispatching a notification to its devices.
pub const PROCESS_JOB: &str = "process";

/// Payload handed to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub notification_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay applied between crash retries of the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn exponential(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms,
        }
    }

    pub fn fixed(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms,
        }
    }

    /// Delay before the next run after `attempts_made` failed runs (1-based).
    pub fn delay_for(&self, attempts_made: u32) -> u64 {
        match self.kind {
            BackoffKind::Fixed => self.base_delay_ms,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1);
                let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(multiplier)
            }
        }
    }
}

/// Options for a single enqueue, produced by the priority policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Hold the job back for this long before it becomes ready.
    pub delay_ms: Option<u64>,
    /// Lower is served first.
    pub priority_rank: u8,
    /// Total runs allowed for this job, including the first.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

/// A job as stored by a queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: DispatchJob,
    pub options: EnqueueOptions,
    /// Runs that already failed.
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl QueuedJob {
    pub fn new(job_type: &str, payload: DispatchJob, options: EnqueueOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            options,
            attempts_made: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    /// Record a failed run. Returns the retry delay, or `None` when the job
    /// has used its whole budget.
    pub fn register_failure(&mut self, error: &str) -> Option<u64> {
        self.attempts_made += 1;
        self.last_error = Some(error.to_string());
        if self.attempts_made < self.options.max_attempts {
            Some(self.options.backoff.delay_for(self.attempts_made))
        } else {
            None
        }
    }
}

/// What happened to a job handed back with [`JobQueue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay_ms: u64 },
    DeadLettered,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Returns the queue-assigned job id.
    async fn enqueue(
        &self,
        job_type: &str,
        payload: DispatchJob,
        options: EnqueueOptions,
    ) -> Result<Uuid, AppError>;

    /// Take the next ready job, if any, leasing it to the caller.
    async fn reserve(&self) -> Result<Option<QueuedJob>, AppError>;

    /// Acknowledge a successfully handled job.
    async fn complete(&self, job: &QueuedJob) -> Result<(), AppError>;

    /// Hand back a job whose run failed.
    async fn fail(&self, job: QueuedJob, error: &str) -> Result<FailOutcome, AppError>;
}
