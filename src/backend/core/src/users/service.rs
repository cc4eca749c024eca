//! Subscription lifecycle service.
//!
//! ```text
//! inactive --activate--> active --expire(time-based)--> expired
//! active   --cancel----> canceled
//! expired  --activate--> active   (fresh timestamps)
//! ```
//!
//! Mutations for one user are serialized in-process with [`KeyedLocks`] and
//! each one is a single atomic statement in the store.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::model::{NewUser, SubscriptionStatus, UserWithSubscription};
use super::provider::SubscriptionProvider;
use super::store::UserStore;
use crate::error::{ConflictReason, ErrorKind, PerchError, Result};
use crate::jobs::builtin::{ActivationPayload, ExpiryPayload, ACTIVATE_QUEUE, EXPIRE_QUEUE};
use crate::jobs::{EnqueueOptions, JobHandle, QueueStore};
use crate::sync::KeyedLocks;

/// Result of an expiry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryOutcome {
    /// The subscription moved to `expired`
    Expired,
    /// Still inside its window; try again later
    NotDue,
    /// Re-activated, canceled, already expired, or gone; nothing to do
    Stale,
}

/// Reads and mutates subscription state.
pub struct SubscriptionService {
    store: Arc<dyn UserStore>,
    provider: Arc<dyn SubscriptionProvider>,
    queue: Option<Arc<dyn QueueStore>>,
    locks: KeyedLocks<Uuid>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn UserStore>, provider: Arc<dyn SubscriptionProvider>) -> Self {
        Self {
            store,
            provider,
            queue: None,
            locks: KeyedLocks::new(),
        }
    }

    /// Schedule expiry jobs and accept asynchronous activations through `queue`.
    pub fn with_queue(mut self, queue: Arc<dyn QueueStore>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn list(&self) -> Result<Vec<UserWithSubscription>> {
        self.store.list().await
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<UserWithSubscription> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| PerchError::user_not_found(id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a user with an `inactive` subscription.
    #[instrument(skip(self, new_user), fields(telegram_id = new_user.telegram_id))]
    pub async fn create(&self, new_user: NewUser) -> Result<UserWithSubscription> {
        match self.store.create(&new_user).await {
            Ok(user) => {
                info!(user_id = %user.id, "User created");
                Ok(user)
            }
            Err(err) if matches!(err.kind(), ErrorKind::Conflict(_)) => {
                Err(self.resolve_conflict(&new_user, err).await)
            }
            Err(err) => Err(err),
        }
    }

    /// A duplicate external id wins over any other reported constraint.
    async fn resolve_conflict(&self, new_user: &NewUser, reported: PerchError) -> PerchError {
        if reported.kind() == ErrorKind::Conflict(ConflictReason::DuplicateExternalId) {
            return reported;
        }
        match self.store.telegram_id_exists(new_user.telegram_id).await {
            Ok(true) => PerchError::conflict(ConflictReason::DuplicateExternalId),
            Ok(false) => reported,
            Err(lookup) => {
                warn!(error = %lookup, "Conflict lookup failed; reporting original constraint");
                reported
            }
        }
    }

    /// Activate (or re-activate) a user's subscription starting now.
    pub async fn activate(&self, user_id: Uuid) -> Result<UserWithSubscription> {
        self.activate_at(user_id, Utc::now()).await
    }

    /// Activate with an explicit clock reading.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn activate_at(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<UserWithSubscription> {
        // Stored timestamps keep millisecond precision.
        let now = now.duration_trunc(Duration::milliseconds(1)).unwrap_or(now);
        let _guard = self.locks.lock(user_id).await;

        if !self.store.user_exists(user_id).await? {
            return Err(PerchError::user_not_found(user_id));
        }

        let grant = self.provider.activate(user_id, now).await?;
        let Some(subscription) = self.store.activate_subscription(user_id, &grant).await? else {
            return Err(PerchError::missing_subscription(user_id));
        };

        info!(
            provider = %grant.provider,
            plan = %grant.plan,
            expires_at = %grant.expires_at,
            "Subscription activated"
        );

        if let Some(expires_at) = subscription.expires_at {
            self.schedule_expiry(user_id, expires_at).await;
        }

        self.get_by_id(user_id).await
    }

    /// `active` → `canceled`.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn cancel(&self, user_id: Uuid) -> Result<UserWithSubscription> {
        let _guard = self.locks.lock(user_id).await;

        if !self.store.user_exists(user_id).await? {
            return Err(PerchError::user_not_found(user_id));
        }

        if self.store.cancel_subscription(user_id, Utc::now()).await?.is_none() {
            return match self.store.subscription(user_id).await? {
                None => Err(PerchError::missing_subscription(user_id)),
                Some(current) => Err(PerchError::conflict(ConflictReason::InvalidTransition)
                    .with_context("status", current.status.as_str())),
            };
        }

        info!("Subscription canceled");
        self.get_by_id(user_id).await
    }

    /// Expire the subscription if it still ends at `expected_expires_at` and that moment has passed.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn expire_if_due(
        &self,
        user_id: Uuid,
        expected_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ExpiryOutcome> {
        let _guard = self.locks.lock(user_id).await;

        if self
            .store
            .expire_subscription(user_id, expected_expires_at, now)
            .await?
        {
            info!("Subscription expired");
            return Ok(ExpiryOutcome::Expired);
        }

        let outcome = match self.store.subscription(user_id).await? {
            Some(s)
                if s.status == SubscriptionStatus::Active
                    && s.expires_at == Some(expected_expires_at)
                    && expected_expires_at > now =>
            {
                ExpiryOutcome::NotDue
            }
            _ => ExpiryOutcome::Stale,
        };
        Ok(outcome)
    }

    /// Queue an activation for the worker pool instead of running it inline.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn enqueue_activation(&self, user_id: Uuid) -> Result<JobHandle> {
        if !self.store.user_exists(user_id).await? {
            return Err(PerchError::user_not_found(user_id));
        }
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| PerchError::queue_unavailable("no queue store configured"))?;

        let payload = serde_json::to_value(ActivationPayload { user_id })?;
        let handle = queue.enqueue(ACTIVATE_QUEUE, payload).await?;
        info!(job_id = %handle.job_id, "Activation queued");
        Ok(handle)
    }

    /// Best effort: the activation already committed, so failures are only logged.
    async fn schedule_expiry(&self, user_id: Uuid, expires_at: DateTime<Utc>) {
        let Some(queue) = self.queue.as_ref() else {
            return;
        };

        let delay = (expires_at - Utc::now()).to_std().unwrap_or_default();
        let payload = match serde_json::to_value(ExpiryPayload { user_id, expires_at }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Could not encode expiry payload");
                return;
            }
        };

        match queue
            .enqueue_with(EXPIRE_QUEUE, payload, EnqueueOptions::delayed(delay))
            .await
        {
            Ok(handle) => info!(job_id = %handle.job_id, delay = ?delay, "Expiry scheduled"),
            Err(e) => warn!(error = %e, "Failed to schedule expiry; subscription stays active until re-checked"),
        }
    }
}
