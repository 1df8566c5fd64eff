//! In-process queue backend with the same ordering rules as the Redis one.
//!
//! State is lost on restart. Used by tests and single-process setups.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use beacon_common::error::AppError;

use super::{DispatchJob, EnqueueOptions, FailOutcome, JobQueue, QueuedJob};

#[derive(Default)]
struct QueueState {
    /// Enqueue counter, keeps equal ranks FIFO.
    seq: u64,
    ready: BTreeMap<(u8, u64), QueuedJob>,
    delayed: Vec<(DateTime<Utc>, QueuedJob)>,
    in_flight: HashMap<Uuid, QueuedJob>,
    dead: Vec<QueuedJob>,
}

impl QueueState {
    fn push_ready(&mut self, job: QueuedJob) {
        self.seq += 1;
        self.ready.insert((job.options.priority_rank, self.seq), job);
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        // Oldest deadline first so promotion keeps deadline order within a rank.
        self.delayed.sort_by_key(|(ready_at, _)| *ready_at);
        let split = self
            .delayed
            .iter()
            .position(|(ready_at, _)| *ready_at > now)
            .unwrap_or(self.delayed.len());
        let due: Vec<_> = self.delayed.drain(..split).collect();
        for (_, job) in due {
            self.push_ready(job);
        }
    }
}

/// In-memory [`JobQueue`].
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delayed job ready regardless of its deadline.
    pub async fn release_delayed(&self) {
        let mut state = self.state.lock().await;
        let far_future = Utc::now() + Duration::days(3650);
        state.promote_due(far_future);
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn delayed_len(&self) -> usize {
        self.state.lock().await.delayed.len()
    }

    /// Delay in milliseconds of every delayed job, relative to now.
    pub async fn delayed_ms(&self) -> Vec<i64> {
        let now = Utc::now();
        self.state
            .lock()
            .await
            .delayed
            .iter()
            .map(|(ready_at, _)| (*ready_at - now).num_milliseconds())
            .collect()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn dead_letters(&self) -> Vec<QueuedJob> {
        self.state.lock().await.dead.clone()
    }

    /// Snapshot of every job not yet handed to a worker.
    pub async fn pending_jobs(&self) -> Vec<QueuedJob> {
        let state = self.state.lock().await;
        state
            .ready
            .values()
            .cloned()
            .chain(state.delayed.iter().map(|(_, job)| job.clone()))
            .collect()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: DispatchJob,
        options: EnqueueOptions,
    ) -> Result<Uuid, AppError> {
        let job = QueuedJob::new(job_type, payload, options);
        let id = job.id;
        let mut state = self.state.lock().await;

        match options.delay_ms.filter(|ms| *ms > 0) {
            Some(delay_ms) => {
                let ready_at = Utc::now() + Duration::milliseconds(delay_ms as i64);
                state.delayed.push((ready_at, job));
            }
            None => state.push_ready(job),
        }

        Ok(id)
    }

    async fn reserve(&self) -> Result<Option<QueuedJob>, AppError> {
        let mut state = self.state.lock().await;
        state.promote_due(Utc::now());

        let Some((_, job)) = state.ready.pop_first() else {
            return Ok(None);
        };
        state.in_flight.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), AppError> {
        self.state.lock().await.in_flight.remove(&job.id);
        Ok(())
    }

    async fn fail(&self, mut job: QueuedJob, error: &str) -> Result<FailOutcome, AppError> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&job.id);

        match job.register_failure(error) {
            Some(delay_ms) => {
                let ready_at = Utc::now() + Duration::milliseconds(delay_ms as i64);
                state.delayed.push((ready_at, job));
                Ok(FailOutcome::Retrying { delay_ms })
            }
            None => {
                state.dead.push(job);
                Ok(FailOutcome::DeadLettered)
            }
        }
    }
}
