//! Built-in background jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{BackoffStrategy, ExecutionPolicy, JobContext, JobError, JobHandler, JobRegistry, JobResult};
use crate::error::Result;
use crate::users::{ExpiryOutcome, SubscriptionService};

/// Queue expiring subscriptions at the end of their window.
pub const EXPIRE_QUEUE: &str = "subscription.expire";

/// Queue running activations requested asynchronously.
pub const ACTIVATE_QUEUE: &str = "subscription.activate";

/// Payload of [`EXPIRE_QUEUE`] jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryPayload {
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Payload of [`ACTIVATE_QUEUE`] jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationPayload {
    pub user_id: Uuid,
}

/// Job: expire a subscription whose window has ended.
///
/// Safe to run any number of times: only an `active` subscription that still
/// ends at the scheduled moment is touched, so a re-activation in the meantime
/// turns this into a no-op.
pub struct SubscriptionExpiryJob {
    service: Arc<SubscriptionService>,
}

impl SubscriptionExpiryJob {
    pub fn new(service: Arc<SubscriptionService>) -> Self {
        Self { service }
    }

    pub fn policy() -> ExecutionPolicy {
        ExecutionPolicy::default()
            .with_max_attempts(10)
            .with_backoff(
                BackoffStrategy::Exponential,
                Duration::from_secs(5),
                Duration::from_secs(600),
            )
            .with_concurrency(2)
    }
}

#[async_trait]
impl JobHandler for SubscriptionExpiryJob {
    async fn handle(&self, ctx: JobContext) -> JobResult {
        let payload: ExpiryPayload = ctx.payload()?;
        let outcome = self
            .service
            .expire_if_due(payload.user_id, payload.expires_at, Utc::now())
            .await?;

        match outcome {
            ExpiryOutcome::Expired | ExpiryOutcome::Stale => {
                tracing::debug!(user_id = %payload.user_id, outcome = ?outcome, "Expiry job resolved");
                Ok(())
            }
            // Delivered early (clock skew between producers); come back later.
            ExpiryOutcome::NotDue => Err(JobError::retryable("subscription not yet due").with_code("NOT_DUE")),
        }
    }
}

/// Job: activate a subscription off the request path.
pub struct SubscriptionActivationJob {
    service: Arc<SubscriptionService>,
}

impl SubscriptionActivationJob {
    pub fn new(service: Arc<SubscriptionService>) -> Self {
        Self { service }
    }

    /// One activation per user at a time.
    pub fn policy() -> ExecutionPolicy {
        ExecutionPolicy::default()
            .with_max_attempts(5)
            .with_backoff(
                BackoffStrategy::Exponential,
                Duration::from_secs(1),
                Duration::from_secs(60),
            )
            .with_concurrency(4)
            .with_per_key("userId")
            .with_timeout(Duration::from_secs(30))
    }
}

#[async_trait]
impl JobHandler for SubscriptionActivationJob {
    async fn handle(&self, ctx: JobContext) -> JobResult {
        let payload: ActivationPayload = ctx.payload()?;
        // NotFound converts to a fatal JobError and is dead-lettered at once.
        let user = self.service.activate(payload.user_id).await?;
        tracing::info!(
            user_id = %user.id,
            attempt = ctx.attempt(),
            expires_at = ?user.subscription_expires_at,
            "Queued activation applied"
        );
        Ok(())
    }
}

/// The registry every server process runs.
pub fn default_registry(service: Arc<SubscriptionService>) -> Result<JobRegistry> {
    Ok(JobRegistry::builder()
        .register(
            EXPIRE_QUEUE,
            SubscriptionExpiryJob::new(service.clone()),
            SubscriptionExpiryJob::policy(),
        )?
        .register(
            ACTIVATE_QUEUE,
            SubscriptionActivationJob::new(service),
            SubscriptionActivationJob::policy(),
        )?
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::{InMemoryUserStore, MockPaymentProvider};

    fn service() -> Arc<SubscriptionService> {
        Arc::new(SubscriptionService::new(
            Arc::new(InMemoryUserStore::new()),
            Arc::new(MockPaymentProvider),
        ))
    }

    #[test]
    fn test_default_registry_queues() {
        let registry = default_registry(service()).unwrap();
        assert_eq!(registry.queues(), vec![ACTIVATE_QUEUE, EXPIRE_QUEUE]);
        assert_eq!(
            registry.require(ACTIVATE_QUEUE).unwrap().policy.per_key.as_deref(),
            Some("userId")
        );
    }

    #[test]
    fn test_expiry_payload_shape() {
        let payload = ExpiryPayload {
            user_id: Uuid::nil(),
            expires_at: Utc::now(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("userId").is_some());
        assert!(json.get("expiresAt").is_some());
    }
}
