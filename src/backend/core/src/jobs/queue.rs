//! Durable job queue abstraction with lease semantics and dead letter handling.
//!
//! A job moves between four places per queue: `ready` (FIFO), `delayed`
//! (ordered by due time), `leased` (owned by one worker until its visibility
//! deadline) and the bounded `dead` list. A lease that is neither acked nor
//! nacked before its deadline is put back on `ready`, which is what gives the
//! queue at-least-once delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::JobId;
use crate::error::{PerchError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Types
// ═══════════════════════════════════════════════════════════════════════════════

/// A job as stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,
    /// Queue the job belongs to
    pub queue: String,
    /// Opaque handler payload
    pub payload: serde_json::Value,
    /// Failed deliveries so far
    pub attempts: u32,
    /// Per-job override of the queue policy's retry budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// When the job was first enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Message of the most recent failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            attempts: 0,
            max_attempts: None,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    /// 1-indexed number of the delivery currently being made.
    pub fn attempt(&self) -> u32 {
        self.attempts + 1
    }
}

/// Options accepted by [`QueueStore::enqueue_with`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Keep the job invisible for this long
    pub delay: Option<Duration>,
    /// Override the queue policy's retry budget
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Reference to a queued or leased job, used to resolve its lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub queue: String,
    pub job_id: JobId,
    /// Backend-specific token identifying this exact delivery
    pub token: String,
}

/// A job together with the handle of its current lease.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: Job,
    pub handle: JobHandle,
}

/// A terminal-failed job kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: Job,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Per-queue counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs ready to be leased
    pub pending: usize,
    /// Jobs waiting for their due time
    pub delayed: usize,
    /// Jobs currently leased
    pub leased: usize,
    /// Jobs in the dead-letter list
    pub dead: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable, at-least-once job store keyed by queue name.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn backend_name(&self) -> &'static str;

    /// Enqueue a job with options.
    async fn enqueue_with(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobHandle>;

    /// Enqueue a job for immediate delivery.
    async fn enqueue(&self, queue: &str, payload: serde_json::Value) -> Result<JobHandle> {
        self.enqueue_with(queue, payload, EnqueueOptions::default())
            .await
    }

    /// Lease the next due job, if any, for `visibility`.
    async fn lease(&self, queue: &str, visibility: Duration) -> Result<Option<LeasedJob>>;

    /// Acknowledge successful processing.
    async fn ack(&self, handle: &JobHandle) -> Result<()>;

    /// Release a failed lease; the job comes back after `retry_after` with one more attempt recorded.
    async fn nack(&self, handle: &JobHandle, retry_after: Duration, error: &str) -> Result<()>;

    /// Hand a lease back untouched; the job comes back after `delay` and no attempt is recorded.
    async fn defer(&self, handle: &JobHandle, delay: Duration) -> Result<()>;

    /// Move a leased job to the dead-letter list. It is never delivered again.
    async fn dead_letter(&self, handle: &JobHandle, reason: &str) -> Result<()>;

    /// Most recent dead letters, newest first.
    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Get queue statistics.
    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;

    /// Release backend connections.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    leased: HashMap<String, (Instant, Job)>,
    dead: VecDeque<DeadLetter>,
}

impl QueueState {
    /// Move due delayed jobs and expired leases back onto `ready`.
    fn promote(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = waiting;
        let mut due = due;
        due.sort_by_key(|(at, _)| *at);
        self.ready.extend(due.into_iter().map(|(_, job)| job));

        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some((_, job)) = self.leased.remove(&token) {
                tracing::debug!(queue = %job.queue, job_id = %job.id, "Lease expired; requeueing");
                self.ready.push_front(job);
            }
        }
    }
}

/// In-memory queue backend for tests and local development.
pub struct InMemoryQueueStore {
    queues: Mutex<HashMap<String, QueueState>>,
    dead_letter_max: usize,
    unavailable: AtomicBool,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::with_dead_letter_max(1000)
    }

    pub fn with_dead_letter_max(dead_letter_max: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            dead_letter_max: dead_letter_max.max(1),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate a backend outage: every operation fails with `QueueUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PerchError::queue_unavailable("in-memory queue marked unavailable"));
        }
        Ok(())
    }

    fn take_lease(&self, handle: &JobHandle) -> Option<Job> {
        let mut queues = self.queues.lock();
        queues
            .get_mut(&handle.queue)
            .and_then(|state| state.leased.remove(&handle.token))
            .map(|(_, job)| job)
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue_with(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobHandle> {
        self.check_available()?;

        let mut job = Job::new(queue, payload);
        job.max_attempts = options.max_attempts;
        let handle = JobHandle {
            queue: queue.to_string(),
            job_id: job.id,
            token: job.id.to_string(),
        };

        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        match options.delay {
            Some(delay) if !delay.is_zero() => state.delayed.push((Instant::now() + delay, job)),
            _ => state.ready.push_back(job),
        }

        tracing::debug!(queue = %queue, job_id = %handle.job_id, "Job enqueued");
        Ok(handle)
    }

    async fn lease(&self, queue: &str, visibility: Duration) -> Result<Option<LeasedJob>> {
        self.check_available()?;

        let now = Instant::now();
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.promote(now);

        let Some(job) = state.ready.pop_front() else {
            return Ok(None);
        };

        let token = Uuid::new_v4().to_string();
        state.leased.insert(token.clone(), (now + visibility, job.clone()));

        Ok(Some(LeasedJob {
            handle: JobHandle {
                queue: queue.to_string(),
                job_id: job.id,
                token,
            },
            job,
        }))
    }

    async fn ack(&self, handle: &JobHandle) -> Result<()> {
        self.check_available()?;
        if self.take_lease(handle).is_none() {
            tracing::debug!(queue = %handle.queue, job_id = %handle.job_id, "Ack for unknown lease ignored");
        }
        Ok(())
    }

    async fn nack(&self, handle: &JobHandle, retry_after: Duration, error: &str) -> Result<()> {
        self.check_available()?;
        let Some(mut job) = self.take_lease(handle) else {
            tracing::debug!(queue = %handle.queue, job_id = %handle.job_id, "Nack for unknown lease ignored");
            return Ok(());
        };

        job.attempts += 1;
        job.last_error = Some(error.to_string());

        let mut queues = self.queues.lock();
        let state = queues.entry(handle.queue.clone()).or_default();
        state.delayed.push((Instant::now() + retry_after, job));
        Ok(())
    }

    async fn defer(&self, handle: &JobHandle, delay: Duration) -> Result<()> {
        self.check_available()?;
        let Some(job) = self.take_lease(handle) else {
            tracing::debug!(queue = %handle.queue, job_id = %handle.job_id, "Defer for unknown lease ignored");
            return Ok(());
        };

        let mut queues = self.queues.lock();
        let state = queues.entry(handle.queue.clone()).or_default();
        state.delayed.push((Instant::now() + delay, job));
        Ok(())
    }

    async fn dead_letter(&self, handle: &JobHandle, reason: &str) -> Result<()> {
        self.check_available()?;
        let Some(mut job) = self.take_lease(handle) else {
            tracing::debug!(queue = %handle.queue, job_id = %handle.job_id, "Dead letter for unknown lease ignored");
            return Ok(());
        };

        job.attempts += 1;
        job.last_error = Some(reason.to_string());

        let mut queues = self.queues.lock();
        let state = queues.entry(handle.queue.clone()).or_default();
        state.dead.push_front(DeadLetter {
            job,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        state.dead.truncate(self.dead_letter_max);
        Ok(())
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        self.check_available()?;
        let queues = self.queues.lock();
        Ok(queues
            .get(queue)
            .map(|state| state.dead.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        self.check_available()?;
        let queues = self.queues.lock();
        Ok(queues
            .get(queue)
            .map(|state| QueueStats {
                pending: state.ready.len(),
                delayed: state.delayed.len(),
                leased: state.leased.len(),
                dead: state.dead.len(),
            })
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_fifo_lease_and_ack() {
        let store = InMemoryQueueStore::new();
        store.enqueue("q", json!({"n": 1})).await.unwrap();
        store.enqueue("q", json!({"n": 2})).await.unwrap();

        let first = store.lease("q", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(first.job.payload["n"], 1);
        assert_eq!(first.job.attempt(), 1);

        store.ack(&first.handle).await.unwrap();
        let stats = store.stats("q").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.leased, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_redelivered() {
        let store = InMemoryQueueStore::new();
        store.enqueue("q", json!({})).await.unwrap();

        let leased = store.lease("q", Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(store.lease("q", VISIBILITY).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = store.lease("q", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(again.job.id, leased.job.id);
        assert_ne!(again.handle.token, leased.handle.token);
        // Crash redelivery does not count as a failed attempt.
        assert_eq!(again.job.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_delays_and_counts_attempt() {
        let store = InMemoryQueueStore::new();
        store.enqueue("q", json!({})).await.unwrap();

        let leased = store.lease("q", VISIBILITY).await.unwrap().unwrap();
        store.nack(&leased.handle, Duration::from_secs(2), "boom").await.unwrap();
        assert!(store.lease("q", VISIBILITY).await.unwrap().is_none());
        assert_eq!(store.stats("q").await.unwrap().delayed, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let retried = store.lease("q", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(retried.job.attempts, 1);
        assert_eq!(retried.job.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_defer_keeps_attempts() {
        let store = InMemoryQueueStore::new();
        store.enqueue("q", json!({})).await.unwrap();

        let leased = store.lease("q", VISIBILITY).await.unwrap().unwrap();
        store.defer(&leased.handle, Duration::from_millis(250)).await.unwrap();
        assert_eq!(store.stats("q").await.unwrap().leased, 0);
        assert!(store.lease("q", VISIBILITY).await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(250)).await;
        let again = store.lease("q", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(again.job.id, leased.job.id);
        assert_eq!(again.job.attempts, 0);
        assert!(again.job.last_error.is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_is_bounded() {
        let store = InMemoryQueueStore::with_dead_letter_max(2);
        for n in 0..3 {
            store.enqueue("q", json!({ "n": n })).await.unwrap();
            let leased = store.lease("q", VISIBILITY).await.unwrap().unwrap();
            store.dead_letter(&leased.handle, "fatal").await.unwrap();
        }

        let dead = store.dead_letters("q", 10).await.unwrap();
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].job.payload["n"], 2);
        assert!(store.lease("q", VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryQueueStore::new();
        store.set_unavailable(true);
        let err = store.enqueue("q", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::QueueUnavailable);
        assert!(store.ping().await.is_err());
    }
}
