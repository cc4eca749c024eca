#![allow(clippy::result_large_err)]
//! # Perch Core
//!
//! User profile and subscription service with a durable background job runtime.
//!
//! ## Architecture
//!
//! - **Users**: profile creation, lookup and the subscription lifecycle
//!   (activate, cancel, expire), serialized per user
//! - **Jobs**: Redis-backed at-least-once queues with leases, retries with
//!   backoff, dead-lettering, and a worker pool with graceful shutdown
//! - **API**: REST endpoints under `/api/v1` with a uniform error payload and
//!   per-client rate limiting
//! - **Server**: serving with a coordinated, bounded shutdown
//! - **Health**: concurrent, time-bounded checks of PostgreSQL and Redis
//! - **Observability**: structured logging, OTLP tracing and Prometheus metrics

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod jobs;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod sync;
pub mod users;

pub use error::{ErrorCode, ErrorKind, PerchError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{ConflictReason, ErrorCode, ErrorKind, PerchError, Result};
    pub use crate::jobs::{
        handler_fn, EnqueueOptions, ExecutionPolicy, JobContext, JobError, JobHandler, JobRegistry,
        JobResult, QueueStore, WorkerConfig, WorkerPool,
    };
    pub use crate::users::{
        NewUser, SubscriptionService, SubscriptionStatus, UserStore, UserWithSubscription,
    };
}
