//! Job definition registry.
//!
//! Binds each queue name to exactly one handler and its [`ExecutionPolicy`].
//! The registry is assembled once at startup through [`JobRegistryBuilder`]
//! and is read-only afterwards; the worker pool takes it by `Arc`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::job::{ExecutionPolicy, JobError, JobResult};
use super::queue::Job;
use crate::error::{PerchError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a handler receives for one delivery.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The delivered job
    pub job: Job,
    /// Cancelled when the pool begins shutting down
    pub cancellation: CancellationToken,
}

impl JobContext {
    /// 1-indexed delivery number.
    pub fn attempt(&self) -> u32 {
        self.job.attempt()
    }

    /// Deserialize the payload; a malformed payload is a fatal error.
    pub fn payload<T: DeserializeOwned>(&self) -> std::result::Result<T, JobError> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }
}

/// A job handler. Must tolerate being invoked more than once for the same job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> JobResult;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> JobResult {
        (self.0)(ctx).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// A queue bound to its handler and policy.
#[derive(Clone)]
pub struct JobDefinition {
    pub queue: String,
    pub handler: Arc<dyn JobHandler>,
    pub policy: ExecutionPolicy,
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("queue", &self.queue)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Immutable queue → definition map.
#[derive(Debug, Default)]
pub struct JobRegistry {
    definitions: HashMap<String, JobDefinition>,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::default()
    }

    pub fn get(&self, queue: &str) -> Option<&JobDefinition> {
        self.definitions.get(queue)
    }

    /// Like [`JobRegistry::get`], as an error for unknown queues.
    pub fn require(&self, queue: &str) -> Result<&JobDefinition> {
        self.get(queue).ok_or_else(|| PerchError::unknown_queue(queue))
    }

    /// Registered queue names, sorted.
    pub fn queues(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn definitions(&self) -> impl Iterator<Item = &JobDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Collects definitions, rejecting duplicates and unusable policies.
#[derive(Debug, Default)]
pub struct JobRegistryBuilder {
    definitions: HashMap<String, JobDefinition>,
}

impl JobRegistryBuilder {
    /// Bind `queue` to `handler`.
    pub fn register<H>(mut self, queue: impl Into<String>, handler: H, policy: ExecutionPolicy) -> Result<Self>
    where
        H: JobHandler,
    {
        self.insert(queue.into(), Arc::new(handler), policy)?;
        Ok(self)
    }

    /// Bind `queue` to an already shared handler.
    pub fn register_arc(
        mut self,
        queue: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        policy: ExecutionPolicy,
    ) -> Result<Self> {
        self.insert(queue.into(), handler, policy)?;
        Ok(self)
    }

    fn insert(&mut self, queue: String, handler: Arc<dyn JobHandler>, policy: ExecutionPolicy) -> Result<()> {
        if queue.is_empty() {
            return Err(PerchError::configuration("queue name must not be empty"));
        }
        if self.definitions.contains_key(&queue) {
            return Err(PerchError::configuration(format!(
                "queue '{}' already has a handler",
                queue
            )));
        }
        policy.validate(&queue)?;

        tracing::debug!(queue = %queue, max_attempts = policy.max_attempts, concurrency = policy.concurrency, "Job handler registered");
        self.definitions.insert(
            queue.clone(),
            JobDefinition {
                queue,
                handler,
                policy,
            },
        );
        Ok(())
    }

    pub fn build(self) -> JobRegistry {
        JobRegistry {
            definitions: self.definitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn noop() -> FnHandler<impl Fn(JobContext) -> std::future::Ready<JobResult>> {
        handler_fn(|_ctx| std::future::ready(Ok(())))
    }

    #[test]
    fn test_duplicate_queue_rejected() {
        let err = JobRegistry::builder()
            .register("emails", noop(), ExecutionPolicy::default())
            .unwrap()
            .register("emails", noop(), ExecutionPolicy::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = JobRegistry::builder().register(
            "emails",
            noop(),
            ExecutionPolicy::default().with_max_attempts(0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_lookup() {
        let registry = JobRegistry::builder()
            .register("b", noop(), ExecutionPolicy::default())
            .unwrap()
            .register("a", noop(), ExecutionPolicy::default().with_concurrency(4))
            .unwrap()
            .build();

        assert_eq!(registry.queues(), vec!["a", "b"]);
        assert_eq!(registry.require("a").unwrap().policy.concurrency, 4);
        assert!(registry.require("c").is_err());
    }

    #[test]
    fn test_context_payload() {
        #[derive(Debug, serde::Deserialize)]
        struct Payload {
            n: u32,
        }
        let ctx = JobContext {
            job: Job::new("q", serde_json::json!({"n": 7})),
            cancellation: CancellationToken::new(),
        };
        assert_eq!(ctx.payload::<Payload>().unwrap().n, 7);
        assert_eq!(ctx.attempt(), 1);

        let bad = JobContext {
            job: Job::new("q", serde_json::json!({"m": 1})),
            cancellation: CancellationToken::new(),
        };
        assert!(!bad.payload::<Payload>().unwrap_err().retryable);
    }
}
