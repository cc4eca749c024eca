//! Health checker implementations for the backing services.
//!
//! This module provides health checkers for:
//! - **Store**: the user store (PostgreSQL in production)
//! - **Queue**: the job queue backend (Redis in production)
//!
//! # Example
//!
//! ```rust,ignore
//! use perch_core::health::{HealthChecker, StoreHealthChecker};
//!
//! let checker = StoreHealthChecker::new(store.clone());
//! let health = checker.check_with_timeout(Duration::from_secs(2)).await;
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::check::ComponentHealth;
use crate::jobs::QueueStore;
use crate::users::UserStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Health Checker Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for health checkers.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// The component name.
    fn name(&self) -> &str;

    /// Perform a health check.
    async fn check(&self) -> ComponentHealth;

    /// Perform a health check bounded by `timeout`. Never fails; a timeout is an error status.
    async fn check_with_timeout(&self, timeout: Duration) -> ComponentHealth {
        let start = Instant::now();

        let health = match tokio::time::timeout(timeout, self.check()).await {
            Ok(health) => health.with_latency(start.elapsed()),
            Err(_) => ComponentHealth::error(
                self.name(),
                format!("Health check timed out after {:?}", timeout),
            )
            .with_latency(start.elapsed()),
        };

        if let Some(error) = &health.error {
            warn!(component = %self.name(), error = %error, "Health check failed");
        }
        health
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Health Checker
// ═══════════════════════════════════════════════════════════════════════════════

/// Checks the user store.
pub struct StoreHealthChecker {
    store: Arc<dyn UserStore>,
}

impl StoreHealthChecker {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthChecker for StoreHealthChecker {
    fn name(&self) -> &str {
        "db"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        let result = self.store.ping().await;
        ComponentHealth::from_result(self.name(), result, start.elapsed())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Health Checker
// ═══════════════════════════════════════════════════════════════════════════════

/// Checks the queue backend.
pub struct QueueHealthChecker {
    queue: Arc<dyn QueueStore>,
}

impl QueueHealthChecker {
    pub fn new(queue: Arc<dyn QueueStore>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl HealthChecker for QueueHealthChecker {
    fn name(&self) -> &str {
        "redis"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        let result = self.queue.ping().await;
        ComponentHealth::from_result(self.name(), result, start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::CheckStatus;
    use crate::jobs::InMemoryQueueStore;

    struct HangingChecker;

    #[async_trait]
    impl HealthChecker for HangingChecker {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn check(&self) -> ComponentHealth {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_timeout_reports_error() {
        let health = HangingChecker.check_with_timeout(Duration::from_millis(20)).await;
        assert_eq!(health.status, CheckStatus::Error);
        assert!(health.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_queue_checker_follows_backend() {
        let queue = Arc::new(InMemoryQueueStore::new());
        let checker = QueueHealthChecker::new(queue.clone());
        assert!(checker.check().await.is_ok());

        queue.set_unavailable(true);
        assert_eq!(checker.check().await.status, CheckStatus::Error);
    }
}
