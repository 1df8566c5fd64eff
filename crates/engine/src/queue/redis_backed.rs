//! Redis-backed priority queue.
//!
//! Key layout under a configurable prefix:
//! - `{prefix}:jobs`    hash, job id → JSON [`QueuedJob`]
//! - `{prefix}:ready`   sorted set, score = rank * 10^12 + sequence
//! - `{prefix}:delayed` sorted set, score = ready-at (unix ms)
//! - `{prefix}:active`  sorted set, score = lease deadline (unix ms)
//! - `{prefix}:seq`     counter keeping equal ranks FIFO
//! - `{prefix}:dead`    list of JSON jobs that used their whole budget
//!
//! Enqueue and reserve run as Lua scripts so promotion of due jobs, recovery
//! of stalled leases and the pop itself are atomic.
//!
//! A lease that expires counts as a failed run: the job's `attempts_made` is
//! bumped and it is dead-lettered once `max_attempts` is reached, so a job
//! that keeps killing its worker cannot run forever.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use beacon_common::error::AppError;

use super::{DispatchJob, EnqueueOptions, FailOutcome, JobQueue, QueuedJob};

/// `last_error` recorded on a job whose lease ran out.
pub const STALLED_ERROR: &str = "job stalled: lease expired before completion";

const ENQUEUE_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
if ARGV[4] ~= '' then
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
else
  local seq = redis.call('INCR', KEYS[4])
  local score = tonumber(ARGV[3]) * 1000000000000 + seq
  redis.call('ZADD', KEYS[2], string.format('%.0f', score), ARGV[1])
end
return 1
"#;

const RESERVE_SCRIPT: &str = r#"
local stalled = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', ARGV[1])
for _, id in ipairs(stalled) do
  redis.call('ZREM', KEYS[4], id)
  local raw = redis.call('HGET', KEYS[1], id)
  if raw then
    local job = cjson.decode(raw)
    job['attempts_made'] = (tonumber(job['attempts_made']) or 0) + 1
    job['last_error'] = ARGV[3]
    local encoded = cjson.encode(job)
    if job['attempts_made'] >= tonumber(job['options']['max_attempts']) then
      redis.call('HDEL', KEYS[1], id)
      redis.call('LPUSH', KEYS[6], encoded)
    else
      redis.call('HSET', KEYS[1], id, encoded)
      redis.call('ZADD', KEYS[3], ARGV[1], id)
    end
  end
end
local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1], 'LIMIT', 0, 500)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[3], id)
  local raw = redis.call('HGET', KEYS[1], id)
  if raw then
    local rank = cjson.decode(raw)['options']['priority_rank']
    local seq = redis.call('INCR', KEYS[5])
    redis.call('ZADD', KEYS[2], string.format('%.0f', rank * 1000000000000 + seq), id)
  end
end
local popped = redis.call('ZPOPMIN', KEYS[2])
if #popped == 0 then
  return false
end
local id = popped[1]
local raw = redis.call('HGET', KEYS[1], id)
if not raw then
  return false
end
redis.call('ZADD', KEYS[4], ARGV[2], id)
return raw
"#;

struct QueueKeys {
    jobs: String,
    ready: String,
    delayed: String,
    active: String,
    seq: String,
    dead: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> Self {
        Self {
            jobs: format!("{}:jobs", prefix),
            ready: format!("{}:ready", prefix),
            delayed: format!("{}:delayed", prefix),
            active: format!("{}:active", prefix),
            seq: format!("{}:seq", prefix),
            dead: format!("{}:dead", prefix),
        }
    }
}

/// [`JobQueue`] backed by Redis sorted sets.
pub struct RedisJobQueue {
    redis: ConnectionManager,
    keys: QueueKeys,
    lease: Duration,
    enqueue_script: Script,
    reserve_script: Script,
}

impl RedisJobQueue {
    /// `lease` bounds how long a reserved job may run before another worker
    /// is allowed to pick it up again.
    pub fn new(redis: ConnectionManager, prefix: &str, lease: Duration) -> Self {
        Self {
            redis,
            keys: QueueKeys::new(prefix),
            lease,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            reserve_script: Script::new(RESERVE_SCRIPT),
        }
    }

    /// Number of ready jobs.
    pub async fn ready_len(&self) -> Result<u64, AppError> {
        let mut conn = self.redis.clone();
        let len: u64 = redis::cmd("ZCARD")
            .arg(&self.keys.ready)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Number of jobs waiting for their delay to elapse.
    pub async fn delayed_len(&self) -> Result<u64, AppError> {
        let mut conn = self.redis.clone();
        let len: u64 = redis::cmd("ZCARD")
            .arg(&self.keys.delayed)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Number of dead-lettered jobs.
    pub async fn dead_letter_len(&self) -> Result<u64, AppError> {
        let mut conn = self.redis.clone();
        let len: u64 = redis::cmd("LLEN")
            .arg(&self.keys.dead)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    fn lease_deadline_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.lease.as_millis() as i64
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: DispatchJob,
        options: EnqueueOptions,
    ) -> Result<Uuid, AppError> {
        let job = QueuedJob::new(job_type, payload, options);
        let raw = serde_json::to_string(&job)?;
        let ready_at = options
            .delay_ms
            .filter(|ms| *ms > 0)
            .map(|ms| (Utc::now().timestamp_millis() + ms as i64).to_string())
            .unwrap_or_default();

        let mut conn = self.redis.clone();
        let _: i64 = self
            .enqueue_script
            .key(&self.keys.jobs)
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&self.keys.seq)
            .arg(job.id.to_string())
            .arg(raw)
            .arg(i64::from(options.priority_rank))
            .arg(ready_at)
            .invoke_async(&mut conn)
            .await?;

        tracing::debug!(
            job_id = %job.id,
            notification_id = %payload.notification_id,
            rank = options.priority_rank,
            delay_ms = options.delay_ms.unwrap_or(0),
            "Job enqueued"
        );
        Ok(job.id)
    }

    async fn reserve(&self) -> Result<Option<QueuedJob>, AppError> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.redis.clone();
        let raw: Option<String> = self
            .reserve_script
            .key(&self.keys.jobs)
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&self.keys.active)
            .key(&self.keys.seq)
            .key(&self.keys.dead)
            .arg(now)
            .arg(self.lease_deadline_ms())
            .arg(STALLED_ERROR)
            .invoke_async(&mut conn)
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), AppError> {
        let id = job.id.to_string();
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREM")
            .arg(&self.keys.active)
            .arg(&id)
            .ignore()
            .cmd("HDEL")
            .arg(&self.keys.jobs)
            .arg(&id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn fail(&self, mut job: QueuedJob, error: &str) -> Result<FailOutcome, AppError> {
        let id = job.id.to_string();
        let outcome = match job.register_failure(error) {
            Some(delay_ms) => FailOutcome::Retrying { delay_ms },
            None => FailOutcome::DeadLettered,
        };
        let raw = serde_json::to_string(&job)?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("ZREM").arg(&self.keys.active).arg(&id).ignore();

        match outcome {
            FailOutcome::Retrying { delay_ms } => {
                let ready_at = Utc::now().timestamp_millis() + delay_ms as i64;
                pipe.cmd("HSET")
                    .arg(&self.keys.jobs)
                    .arg(&id)
                    .arg(&raw)
                    .ignore()
                    .cmd("ZADD")
                    .arg(&self.keys.delayed)
                    .arg(ready_at)
                    .arg(&id)
                    .ignore();
            }
            FailOutcome::DeadLettered => {
                pipe.cmd("HDEL")
                    .arg(&self.keys.jobs)
                    .arg(&id)
                    .ignore()
                    .cmd("LPUSH")
                    .arg(&self.keys.dead)
                    .arg(&raw)
                    .ignore();
            }
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("beacon:notifications");
        assert_eq!(keys.jobs, "beacon:notifications:jobs");
        assert_eq!(keys.ready, "beacon:notifications:ready");
        assert_eq!(keys.delayed, "beacon:notifications:delayed");
        assert_eq!(keys.active, "beacon:notifications:active");
        assert_eq!(keys.seq, "beacon:notifications:seq");
        assert_eq!(keys.dead, "beacon:notifications:dead");
    }
}
