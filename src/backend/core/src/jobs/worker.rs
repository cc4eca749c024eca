//! Worker pool for concurrent job execution.
//!
//! For every queue in the [`JobRegistry`] the pool runs `policy.concurrency`
//! executor tasks. Each executor loops: lease, run the handler in isolation,
//! resolve the lease (ack, nack with backoff, or dead-letter). A job whose
//! per-key lock is taken is handed back with a short delay instead of tying up
//! its executor and lease. Shutdown stops leasing at once and waits for
//! in-flight handlers up to a deadline.

use futures::FutureExt;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::job::{JobError, JobId};
use super::queue::{LeasedJob, QueueStore};
use super::registry::{JobContext, JobDefinition, JobRegistry};
use crate::config::WorkersConfig;
use crate::sync::KeyedLocks;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name/identifier
    pub name: String,
    /// Sleep between empty lease attempts
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Visibility timeout of each lease
    #[serde(with = "humantime_serde")]
    pub lease_timeout: Duration,
    /// How long shutdown waits for in-flight handlers
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Redelivery delay for a job whose key is held by another executor
    #[serde(with = "humantime_serde")]
    pub key_busy_delay: Duration,
    /// Capacity of the job event channel
    pub event_buffer_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "perch-worker".to_string(),
            poll_interval: Duration::from_millis(500),
            lease_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            key_busy_delay: Duration::from_millis(250),
            event_buffer_size: 256,
        }
    }
}

impl From<&WorkersConfig> for WorkerConfig {
    fn from(config: &WorkersConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            lease_timeout: config.lease_timeout,
            shutdown_timeout: config.shutdown_timeout,
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events & Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Observable outcome of one delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Completed {
        queue: String,
        job_id: JobId,
        attempt: u32,
    },
    Retrying {
        queue: String,
        job_id: JobId,
        attempt: u32,
        #[serde(with = "humantime_serde")]
        retry_in: Duration,
        error: String,
    },
    /// Retry budget exhausted or fatal error; the job was dead-lettered
    Failed {
        queue: String,
        job_id: JobId,
        attempt: u32,
        error: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Completed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            Self::Completed { queue, .. }
            | Self::Retrying { queue, .. }
            | Self::Failed { queue, .. } => queue,
        }
    }
}

/// Statistics for the worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Deliveries handled
    pub processed: Arc<AtomicU64>,
    /// Deliveries acked
    pub succeeded: Arc<AtomicU64>,
    /// Deliveries nacked for retry
    pub retried: Arc<AtomicU64>,
    /// Jobs moved to the dead-letter list
    pub dead_lettered: Arc<AtomicU64>,
    /// Deliveries handed back because their key was busy
    pub deferred: Arc<AtomicU64>,
    /// Handler panics caught
    pub panicked: Arc<AtomicU64>,
    /// Handlers running right now
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Result of [`WorkerHandle::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every executor finished before the deadline
    pub drained: bool,
    /// Executors aborted at the deadline; their leases will be redelivered
    pub abandoned: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs every registered queue against one queue store.
pub struct WorkerPool {
    store: Arc<dyn QueueStore>,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
    stats: WorkerStats,
    events: broadcast::Sender<JobEvent>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn QueueStore>, registry: Arc<JobRegistry>, config: WorkerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer_size.max(1));
        Self {
            store,
            registry,
            config,
            stats: WorkerStats::new(),
            events,
        }
    }

    /// Subscribe to job events. Subscribe before `start` to see every event.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Spawn the executors, returning a handle for control.
    pub fn start(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let locks = Arc::new(KeyedLocks::<String>::new());
        let mut tasks = JoinSet::new();

        for definition in self.registry.definitions() {
            let executor = Arc::new(Executor {
                store: self.store.clone(),
                definition: definition.clone(),
                config: self.config.clone(),
                stats: self.stats.clone(),
                events: self.events.clone(),
                locks: locks.clone(),
                cancel: cancel.clone(),
            });

            for index in 0..definition.policy.concurrency {
                let span = tracing::info_span!("executor", queue = %definition.queue, index);
                tasks.spawn(executor.clone().run().instrument(span));
            }
        }

        info!(
            worker = %self.config.name,
            backend = self.store.backend_name(),
            queues = ?self.registry.queues(),
            executors = tasks.len(),
            "Worker pool started"
        );

        WorkerHandle {
            name: self.config.name,
            shutdown_timeout: self.config.shutdown_timeout,
            cancel,
            tasks,
            stats: self.stats,
            events: self.events,
        }
    }
}

/// Handle for controlling a running pool.
pub struct WorkerHandle {
    name: String,
    shutdown_timeout: Duration,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    stats: WorkerStats,
    events: broadcast::Sender<JobEvent>,
}

impl WorkerHandle {
    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Executors still running.
    pub fn executors(&self) -> usize {
        self.tasks.len()
    }

    /// Stop leasing, wait for in-flight handlers, abort whatever is left at the deadline.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!(worker = %self.name, in_flight = self.stats.active(), "Worker pool shutting down");
        self.cancel.cancel();

        let tasks = &mut self.tasks;
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Executor task ended abnormally");
                }
            }
        };
        let drained = tokio::time::timeout(self.shutdown_timeout, drain).await.is_ok();

        let report = if drained {
            ShutdownReport {
                drained: true,
                abandoned: 0,
            }
        } else {
            let abandoned = self.tasks.len();
            warn!(
                worker = %self.name,
                abandoned,
                timeout = ?self.shutdown_timeout,
                "Shutdown deadline reached; abandoning in-flight jobs"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
            ShutdownReport {
                drained: false,
                abandoned,
            }
        };

        info!(worker = %self.name, drained = report.drained, "Worker pool stopped");
        report
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor
// ═══════════════════════════════════════════════════════════════════════════════

struct Executor {
    store: Arc<dyn QueueStore>,
    definition: JobDefinition,
    config: WorkerConfig,
    stats: WorkerStats,
    events: broadcast::Sender<JobEvent>,
    locks: Arc<KeyedLocks<String>>,
    cancel: CancellationToken,
}

impl Executor {
    async fn run(self: Arc<Self>) {
        let queue = self.definition.queue.as_str();
        debug!(queue = %queue, "Executor started");

        loop {
            let leased = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                leased = self.store.lease(queue, self.config.lease_timeout) => leased,
            };

            match leased {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {
                    if self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Lease failed; backing off");
                    if self.idle().await {
                        break;
                    }
                }
            }
        }

        debug!(queue = %queue, "Executor stopped");
    }

    /// Sleep one poll interval; true if shutdown began meanwhile.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(self.config.poll_interval) => false,
        }
    }

    fn lock_key(&self, leased: &LeasedJob) -> Option<String> {
        let field = self.definition.policy.per_key.as_deref()?;
        let value = match leased.job.payload.get(field)? {
            serde_json::Value::Null => return None,
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Some(format!("{}:{}", self.definition.queue, value))
    }

    async fn process(&self, leased: LeasedJob) {
        let _key_guard = match self.lock_key(&leased) {
            Some(key) => match self.locks.try_lock(key) {
                Some(guard) => Some(guard),
                None => return self.defer(&leased).await,
            },
            None => None,
        };

        let queue = self.definition.queue.as_str();
        let attempt = leased.job.attempt();
        let job_id = leased.job.id;
        let policy = &self.definition.policy;
        let max_attempts = leased.job.max_attempts.unwrap_or(policy.max_attempts).max(1);

        self.stats.active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let ctx = JobContext {
            job: leased.job.clone(),
            cancellation: self.cancel.child_token(),
        };
        let execution = AssertUnwindSafe(self.definition.handler.handle(ctx)).catch_unwind();
        let outcome = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(JobError::retryable(format!(
                    "handler timed out after {:?}",
                    limit
                )))),
            },
            None => execution.await,
        };
        let result = outcome.unwrap_or_else(|panic| {
            self.stats.panicked.fetch_add(1, Ordering::Relaxed);
            Err(JobError::retryable(format!(
                "handler panicked: {}",
                panic_message(&panic)
            ))
            .with_code("HANDLER_PANIC"))
        });

        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        histogram!("perch_job_duration_seconds", "queue" => queue.to_string())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                if let Err(e) = self.store.ack(&leased.handle).await {
                    warn!(queue = %queue, job_id = %job_id, error = %e, "Ack failed; job will be redelivered");
                }
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                counter!("perch_jobs_total", "queue" => queue.to_string(), "outcome" => "completed").increment(1);
                info!(queue = %queue, job_id = %job_id, attempt, "Job completed");
                self.emit(JobEvent::Completed {
                    queue: queue.to_string(),
                    job_id,
                    attempt,
                });
            }
            Err(err) if err.retryable && attempt < max_attempts => {
                let retry_in = policy.retry_delay(attempt);
                if let Err(e) = self
                    .store
                    .nack(&leased.handle, retry_in, &err.to_string())
                    .await
                {
                    error!(queue = %queue, job_id = %job_id, error = %e, "Nack failed; job will be redelivered after lease expiry");
                }
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                counter!("perch_jobs_total", "queue" => queue.to_string(), "outcome" => "retried").increment(1);
                warn!(
                    queue = %queue,
                    job_id = %job_id,
                    attempt,
                    max_attempts,
                    retry_in = ?retry_in,
                    error = %err,
                    "Job failed; retrying"
                );
                self.emit(JobEvent::Retrying {
                    queue: queue.to_string(),
                    job_id,
                    attempt,
                    retry_in,
                    error: err.to_string(),
                });
            }
            Err(err) => {
                if let Err(e) = self.store.dead_letter(&leased.handle, &err.to_string()).await {
                    error!(queue = %queue, job_id = %job_id, error = %e, "Dead-lettering failed; job will be redelivered after lease expiry");
                }
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                counter!("perch_jobs_total", "queue" => queue.to_string(), "outcome" => "dead").increment(1);
                error!(
                    queue = %queue,
                    job_id = %job_id,
                    attempt,
                    max_attempts,
                    retryable = err.retryable,
                    error = %err,
                    "Job failed permanently"
                );
                self.emit(JobEvent::Failed {
                    queue: queue.to_string(),
                    job_id,
                    attempt,
                    error: err.to_string(),
                });
            }
        }
    }

    /// Another executor holds this job's key; give the lease back without spending an attempt.
    async fn defer(&self, leased: &LeasedJob) {
        let queue = self.definition.queue.as_str();
        if let Err(e) = self.store.defer(&leased.handle, self.config.key_busy_delay).await {
            warn!(queue = %queue, job_id = %leased.job.id, error = %e, "Defer failed; job will be redelivered after lease expiry");
        }
        self.stats.deferred.fetch_add(1, Ordering::Relaxed);
        counter!("perch_jobs_total", "queue" => queue.to_string(), "outcome" => "deferred").increment(1);
        debug!(queue = %queue, job_id = %leased.job.id, delay = ?self.config.key_busy_delay, "Key busy; job deferred");
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_from_settings() {
        let settings = WorkersConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let config = WorkerConfig::from(&settings);
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.name, "perch-worker");
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);
        stats.processed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.clone().processed(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&payload), "bang");
    }
}
