//! Payment provider seam.
//!
//! Real billing is out of scope; [`MockPaymentProvider`] grants every request.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::model::SubscriptionGrant;
use crate::error::Result;

/// Length of one subscription period in milliseconds (seven days).
pub const SUBSCRIPTION_PERIOD_MS: i64 = 604_800_000;

pub const MOCK_PROVIDER_NAME: &str = "mock-payment-provider";
pub const PREMIUM_PLAN: &str = "premium";

pub fn subscription_period() -> Duration {
    Duration::milliseconds(SUBSCRIPTION_PERIOD_MS)
}

/// Grants subscriptions on behalf of an external billing system.
#[async_trait]
pub trait SubscriptionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Grant a subscription period starting at `now`.
    async fn activate(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<SubscriptionGrant>;
}

/// Always succeeds with a seven day premium plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockPaymentProvider;

#[async_trait]
impl SubscriptionProvider for MockPaymentProvider {
    fn name(&self) -> &str {
        MOCK_PROVIDER_NAME
    }

    async fn activate(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<SubscriptionGrant> {
        tracing::debug!(user_id = %user_id, provider = MOCK_PROVIDER_NAME, "Granting mock subscription");
        Ok(SubscriptionGrant {
            provider: MOCK_PROVIDER_NAME.to_string(),
            plan: PREMIUM_PLAN.to_string(),
            activated_at: now,
            expires_at: now + subscription_period(),
        })
    }
}
