//! Health Check System
//!
//! Checks the relational store and the queue backend concurrently, each
//! bounded by the configured timeout, and folds the results into a
//! `{status, db, redis, timestamp}` snapshot. Checking never fails; a broken
//! or hanging dependency shows up as `error` in the snapshot.

mod check;
mod checker;
mod routes;

pub use check::*;
pub use checker::*;
pub use routes::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::HealthCheckConfig;

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Timeout for each dependency check
    pub check_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&HealthCheckConfig> for HealthConfig {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            check_timeout: config.timeout,
        }
    }
}

/// Health service aggregating the store and queue checks
pub struct HealthService {
    config: HealthConfig,
    db: Arc<dyn HealthChecker>,
    redis: Arc<dyn HealthChecker>,
    started_at: Instant,
}

impl HealthService {
    pub fn new(config: HealthConfig, db: Arc<dyn HealthChecker>, redis: Arc<dyn HealthChecker>) -> Self {
        Self {
            config,
            db,
            redis,
            started_at: Instant::now(),
        }
    }

    /// Run both checks concurrently; one failing does not cut the other short.
    pub async fn check_health(&self) -> HealthReport {
        let timeout = self.config.check_timeout;
        let (db, redis) = tokio::join!(
            self.db.check_with_timeout(timeout),
            self.redis.check_with_timeout(timeout),
        );

        HealthReport::from_components(db, redis).with_uptime(self.started_at.elapsed())
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        self.check_health().await.snapshot
    }

    /// Get the service uptime.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
