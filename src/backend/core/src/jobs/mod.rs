//! Background job system for Perch Core.
//!
//! This module provides an at-least-once job system with:
//!
//! - **Queue Store**: durable per-queue storage with leases, delayed retries and a
//!   bounded dead-letter list (Redis in production, in-memory for tests)
//! - **Registry**: binds each queue name to one handler and its execution policy
//! - **Worker Pool**: runs `concurrency` executors per queue with panic isolation,
//!   per-key serialization and bounded graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          Background Job System                           │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐                │
//! │  │ JobRegistry  │───▶│  WorkerPool  │◀──▶│  QueueStore  │◀── enqueue ──  │
//! │  │ queue→handler│    │  executors   │    │ ready/delayed│    (service)   │
//! │  │   + policy   │    │  per queue   │    │ leases/dead  │                │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘                │
//! │                             ▼                                            │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │ Built-in jobs: subscription.expire • subscription.activate         │  │
//! │  └────────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use perch_core::jobs::{handler_fn, ExecutionPolicy, JobRegistry, WorkerConfig, WorkerPool};
//!
//! let registry = JobRegistry::builder()
//!     .register("emails", handler_fn(|ctx| async move { send(ctx.payload()?).await }), ExecutionPolicy::default())?
//!     .build();
//!
//! let handle = WorkerPool::new(queue_store, Arc::new(registry), WorkerConfig::default()).start();
//! // ...
//! handle.shutdown().await;
//! ```

pub mod builtin;
pub mod job;
pub mod queue;
pub mod redis_queue;
pub mod registry;
pub mod worker;

pub use job::{BackoffStrategy, ExecutionPolicy, JobError, JobId, JobResult};
pub use queue::{
    DeadLetter, EnqueueOptions, InMemoryQueueStore, Job, JobHandle, LeasedJob, QueueStats, QueueStore,
};
pub use redis_queue::RedisQueueStore;
pub use registry::{handler_fn, FnHandler, JobContext, JobDefinition, JobHandler, JobRegistry, JobRegistryBuilder};
pub use worker::{JobEvent, ShutdownReport, WorkerConfig, WorkerHandle, WorkerPool, WorkerStats};

pub use builtin::{
    default_registry, SubscriptionActivationJob, SubscriptionExpiryJob, ACTIVATE_QUEUE, EXPIRE_QUEUE,
};
