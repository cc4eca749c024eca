//! Persistence seam for users and subscriptions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::model::{NewUser, Subscription, SubscriptionGrant, SubscriptionStatus, User, UserWithSubscription};
use crate::error::{ConflictReason, PerchError, Result};

/// Storage operations the subscription service relies on.
///
/// Every mutating method is a single atomic statement (or transaction) so
/// that concurrent callers never observe a half-written subscription.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// All users with their subscriptions, oldest first.
    async fn list(&self) -> Result<Vec<UserWithSubscription>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserWithSubscription>>;

    async fn user_exists(&self, id: Uuid) -> Result<bool>;

    async fn telegram_id_exists(&self, telegram_id: i64) -> Result<bool>;

    async fn subscription(&self, user_id: Uuid) -> Result<Option<Subscription>>;

    /// Insert the user and its `inactive` subscription together.
    ///
    /// Unique violations surface as conflict errors.
    async fn create(&self, new_user: &NewUser) -> Result<UserWithSubscription>;

    /// Set the subscription `active` with the granted window. `None` if the row is missing.
    async fn activate_subscription(&self, user_id: Uuid, grant: &SubscriptionGrant) -> Result<Option<Subscription>>;

    /// `active` → `canceled`. `None` if the row is missing or not active.
    async fn cancel_subscription(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<Subscription>>;

    /// `active` → `expired` only if the window still ends at `expected_expires_at` and is over.
    async fn expire_subscription(
        &self,
        user_id: Uuid,
        expected_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    subscriptions: HashMap<Uuid, Subscription>,
}

/// In-memory store for tests and running without Postgres.
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete a user's subscription row, leaving the user in place.
    pub fn remove_subscription(&self, user_id: Uuid) -> Option<Subscription> {
        self.tables.write().subscriptions.remove(&user_id)
    }

    /// Simulate a database outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PerchError::from(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn list(&self) -> Result<Vec<UserWithSubscription>> {
        self.check_available()?;
        let tables = self.tables.read();
        let mut users: Vec<&User> = tables.users.values().collect();
        users.sort_by_key(|u| (u.created_at, u.id));
        Ok(users
            .into_iter()
            .map(|u| UserWithSubscription::from_parts(u.clone(), tables.subscriptions.get(&u.id)))
            .collect())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserWithSubscription>> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables
            .users
            .get(&id)
            .map(|u| UserWithSubscription::from_parts(u.clone(), tables.subscriptions.get(&id))))
    }

    async fn user_exists(&self, id: Uuid) -> Result<bool> {
        self.check_available()?;
        Ok(self.tables.read().users.contains_key(&id))
    }

    async fn telegram_id_exists(&self, telegram_id: i64) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .users
            .values()
            .any(|u| u.telegram_id == telegram_id))
    }

    async fn subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        self.check_available()?;
        Ok(self.tables.read().subscriptions.get(&user_id).cloned())
    }

    async fn create(&self, new_user: &NewUser) -> Result<UserWithSubscription> {
        self.check_available()?;
        let mut tables = self.tables.write();

        // Postgres may report either constraint first. Email goes first here;
        // the service resolves precedence.
        if let Some(email) = new_user.email.as_deref() {
            if tables.users.values().any(|u| u.email.as_deref() == Some(email)) {
                return Err(PerchError::conflict(ConflictReason::DuplicateEmail));
            }
        }
        if tables.users.values().any(|u| u.telegram_id == new_user.telegram_id) {
            return Err(PerchError::conflict(ConflictReason::DuplicateExternalId));
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            telegram_id: new_user.telegram_id,
            username: new_user.username.clone(),
            first_name: new_user.first_name.clone(),
            last_name: new_user.last_name.clone(),
            language_code: new_user.language_code.clone(),
            is_bot: new_user.is_bot.unwrap_or(false),
            is_premium: new_user.is_premium.unwrap_or(false),
            email: new_user.email.clone(),
            created_at: now,
            updated_at: now,
        };
        let subscription = Subscription::inactive(user.id, now);
        let projection = UserWithSubscription::from_parts(user.clone(), Some(&subscription));

        tables.subscriptions.insert(user.id, subscription);
        tables.users.insert(user.id, user);
        Ok(projection)
    }

    async fn activate_subscription(&self, user_id: Uuid, grant: &SubscriptionGrant) -> Result<Option<Subscription>> {
        self.check_available()?;
        let mut tables = self.tables.write();
        Ok(tables.subscriptions.get_mut(&user_id).map(|s| {
            s.status = SubscriptionStatus::Active;
            s.provider = Some(grant.provider.clone());
            s.plan = Some(grant.plan.clone());
            s.activated_at = Some(grant.activated_at);
            s.expires_at = Some(grant.expires_at);
            s.updated_at = Utc::now();
            s.clone()
        }))
    }

    async fn cancel_subscription(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<Subscription>> {
        self.check_available()?;
        let mut tables = self.tables.write();
        Ok(tables
            .subscriptions
            .get_mut(&user_id)
            .filter(|s| s.status == SubscriptionStatus::Active)
            .map(|s| {
                s.status = SubscriptionStatus::Canceled;
                s.updated_at = now;
                s.clone()
            }))
    }

    async fn expire_subscription(
        &self,
        user_id: Uuid,
        expected_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_available()?;
        let mut tables = self.tables.write();
        match tables.subscriptions.get_mut(&user_id) {
            Some(s)
                if s.status == SubscriptionStatus::Active
                    && s.expires_at == Some(expected_expires_at)
                    && expected_expires_at <= now =>
            {
                s.status = SubscriptionStatus::Expired;
                s.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
