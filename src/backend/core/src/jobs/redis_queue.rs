//! Redis-backed queue store.
//!
//! Keys per queue, under the configured prefix:
//!
//! | key                          | type | contents                             |
//! |------------------------------|------|--------------------------------------|
//! | `{prefix}:{queue}:ready`      | list | serialized jobs, FIFO                |
//! | `{prefix}:{queue}:delayed`    | zset | serialized jobs scored by due ms     |
//! | `{prefix}:{queue}:processing` | list | serialized jobs currently leased     |
//! | `{prefix}:{queue}:leases`     | zset | serialized jobs scored by deadline ms|
//! | `{prefix}:{queue}:dead`       | list | dead letters, newest first, trimmed  |
//!
//! The serialized job is itself the lease token: acking removes that exact
//! string from `processing` and `leases` in one MULTI block. Requeueing and
//! dead-lettering run as scripts that only write the follow-up entry when the
//! lease was still held, so a job is never both dropped and reclaimed.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;

use super::queue::{DeadLetter, EnqueueOptions, Job, JobHandle, LeasedJob, QueueStats, QueueStore};
use crate::error::Result;

/// Promotes due delayed jobs, reclaims expired leases, then leases one job.
const LEASE_SCRIPT: &str = r#"
local ready = KEYS[1]
local delayed = KEYS[2]
local processing = KEYS[3]
local leases = KEYS[4]
local now = tonumber(ARGV[1])
local deadline = tonumber(ARGV[2])

local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', now, 'LIMIT', 0, 100)
for _, member in ipairs(due) do
    redis.call('ZREM', delayed, member)
    redis.call('RPUSH', ready, member)
end

local expired = redis.call('ZRANGEBYSCORE', leases, '-inf', now, 'LIMIT', 0, 100)
for _, member in ipairs(expired) do
    redis.call('ZREM', leases, member)
    redis.call('LREM', processing, 1, member)
    redis.call('LPUSH', ready, member)
end

local job = redis.call('LPOP', ready)
if not job then
    return false
end
redis.call('RPUSH', processing, job)
redis.call('ZADD', leases, deadline, job)
return job
"#;

/// Moves a held lease back to `delayed`. Returns 0 if the lease was already reclaimed.
const REQUEUE_SCRIPT: &str = r#"
local processing = KEYS[1]
local leases = KEYS[2]
local delayed = KEYS[3]

if redis.call('LREM', processing, 1, ARGV[1]) == 0 then
    return 0
end
redis.call('ZREM', leases, ARGV[1])
redis.call('ZADD', delayed, tonumber(ARGV[3]), ARGV[2])
return 1
"#;

/// Moves a held lease to the bounded dead list. Returns 0 if the lease was already reclaimed.
const BURY_SCRIPT: &str = r#"
local processing = KEYS[1]
local leases = KEYS[2]
local dead = KEYS[3]

if redis.call('LREM', processing, 1, ARGV[1]) == 0 then
    return 0
end
redis.call('ZREM', leases, ARGV[1])
redis.call('LPUSH', dead, ARGV[2])
redis.call('LTRIM', dead, 0, tonumber(ARGV[3]) - 1)
return 1
"#;

/// Redis-backed queue store for production use.
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
    prefix: String,
    dead_letter_max: usize,
    lease_script: Script,
    requeue_script: Script,
    bury_script: Script,
}

impl RedisQueueStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL
    /// * `prefix` - Namespace for every queue key (e.g. `"perch"`)
    /// * `dead_letter_max` - Entries kept per dead-letter list
    pub async fn connect(url: &str, prefix: impl Into<String>, dead_letter_max: usize) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            dead_letter_max: dead_letter_max.max(1),
            lease_script: Script::new(LEASE_SCRIPT),
            requeue_script: Script::new(REQUEUE_SCRIPT),
            bury_script: Script::new(BURY_SCRIPT),
        })
    }

    fn key(&self, queue: &str, part: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, part)
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn after_ms(delay: Duration) -> i64 {
        Self::now_ms() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2)
    }

    /// Swap the lease for `body` in `delayed`. False if the lease is gone.
    async fn requeue(&self, handle: &JobHandle, body: &str, delay: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .requeue_script
            .key(self.key(&handle.queue, "processing"))
            .key(self.key(&handle.queue, "leases"))
            .key(self.key(&handle.queue, "delayed"))
            .arg(&handle.token)
            .arg(body)
            .arg(Self::after_ms(delay))
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    /// Swap the lease for `record` in the dead list. False if the lease is gone.
    async fn bury(&self, queue: &str, token: &str, record: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .bury_script
            .key(self.key(queue, "processing"))
            .key(self.key(queue, "leases"))
            .key(self.key(queue, "dead"))
            .arg(token)
            .arg(record)
            .arg(self.dead_letter_max)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue_with(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobHandle> {
        let mut job = Job::new(queue, payload);
        job.max_attempts = options.max_attempts;
        let serialized = serde_json::to_string(&job)?;

        let mut conn = self.conn.clone();
        match options.delay {
            Some(delay) if !delay.is_zero() => {
                redis::cmd("ZADD")
                    .arg(self.key(queue, "delayed"))
                    .arg(Self::after_ms(delay))
                    .arg(&serialized)
                    .query_async::<_, i64>(&mut conn)
                    .await?;
            }
            _ => {
                redis::cmd("RPUSH")
                    .arg(self.key(queue, "ready"))
                    .arg(&serialized)
                    .query_async::<_, i64>(&mut conn)
                    .await?;
            }
        }

        tracing::debug!(queue = %queue, job_id = %job.id, "Job enqueued");
        Ok(JobHandle {
            queue: queue.to_string(),
            job_id: job.id,
            token: serialized,
        })
    }

    async fn lease(&self, queue: &str, visibility: Duration) -> Result<Option<LeasedJob>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .lease_script
            .key(self.key(queue, "ready"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "processing"))
            .key(self.key(queue, "leases"))
            .arg(Self::now_ms())
            .arg(Self::after_ms(visibility))
            .invoke_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<Job>(&raw) {
            Ok(job) => Ok(Some(LeasedJob {
                handle: JobHandle {
                    queue: queue.to_string(),
                    job_id: job.id,
                    token: raw,
                },
                job,
            })),
            Err(e) => {
                // Unparseable entries would be redelivered forever; park them.
                tracing::error!(queue = %queue, error = %e, "Discarding malformed job entry");
                let record = serde_json::json!({
                    "raw": raw,
                    "reason": format!("malformed job: {}", e),
                    "failed_at": Utc::now(),
                });
                self.bury(queue, &raw, &record.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, handle: &JobHandle) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("LREM").arg(self.key(&handle.queue, "processing")).arg(1).arg(&handle.token).ignore()
            .cmd("ZREM").arg(self.key(&handle.queue, "leases")).arg(&handle.token).ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, handle: &JobHandle, retry_after: Duration, error: &str) -> Result<()> {
        let mut job: Job = serde_json::from_str(&handle.token)?;
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        let retried = serde_json::to_string(&job)?;

        // The lease was already reclaimed and handed to someone else.
        if !self.requeue(handle, &retried, retry_after).await? {
            tracing::debug!(queue = %handle.queue, job_id = %handle.job_id, "Nack for unknown lease ignored");
        }
        Ok(())
    }

    async fn defer(&self, handle: &JobHandle, delay: Duration) -> Result<()> {
        if !self.requeue(handle, &handle.token, delay).await? {
            tracing::debug!(queue = %handle.queue, job_id = %handle.job_id, "Defer for unknown lease ignored");
        }
        Ok(())
    }

    async fn dead_letter(&self, handle: &JobHandle, reason: &str) -> Result<()> {
        let mut job: Job = serde_json::from_str(&handle.token)?;
        job.attempts += 1;
        job.last_error = Some(reason.to_string());
        let record = serde_json::to_string(&DeadLetter {
            job,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        })?;

        if !self.bury(&handle.queue, &handle.token, &record).await? {
            tracing::debug!(queue = %handle.queue, job_id = %handle.job_id, "Dead letter for unknown lease ignored");
        }
        Ok(())
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key(queue, "dead"))
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?;

        // Entries parked by the malformed-job path have no job body and are skipped.
        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str::<DeadLetter>(entry).ok())
            .collect())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let (pending, delayed, leased, dead): (usize, usize, usize, usize) = redis::pipe()
            .cmd("LLEN").arg(self.key(queue, "ready"))
            .cmd("ZCARD").arg(self.key(queue, "delayed"))
            .cmd("ZCARD").arg(self.key(queue, "leases"))
            .cmd("LLEN").arg(self.key(queue, "dead"))
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            pending,
            delayed,
            leased,
            dead,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager closes when the last clone is dropped.
        tracing::info!(prefix = %self.prefix, "Redis queue store released");
        Ok(())
    }
}
