//! User and subscription records, and the projection returned to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    #[default]
    Inactive,
    Active,
    Expired,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of `users`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub is_bot: bool,
    pub is_premium: bool,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row of `user_subscriptions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    #[sqlx(rename = "subscription_status")]
    pub status: SubscriptionStatus,
    #[sqlx(rename = "subscription_provider")]
    pub provider: Option<String>,
    #[sqlx(rename = "subscription_plan")]
    pub plan: Option<String>,
    #[sqlx(rename = "subscription_activated_at")]
    pub activated_at: Option<DateTime<Utc>>,
    #[sqlx(rename = "subscription_expires_at")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// The default row created alongside a user.
    pub fn inactive(user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: SubscriptionStatus::Inactive,
            provider: None,
            plan: None,
            activated_at: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Client-facing view of a user joined with its subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserWithSubscription {
    pub id: Uuid,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub is_bot: bool,
    pub is_premium: bool,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub subscription_status: SubscriptionStatus,
    pub subscription_provider: Option<String>,
    pub subscription_plan: Option<String>,
    pub subscription_activated_at: Option<DateTime<Utc>>,
    pub subscription_expires_at: Option<DateTime<Utc>>,
}

impl UserWithSubscription {
    /// Join a user with its subscription; a missing row projects as `inactive`.
    pub fn from_parts(user: User, subscription: Option<&Subscription>) -> Self {
        Self {
            id: user.id,
            telegram_id: user.telegram_id,
            username: user.username,
            first_name: user.first_name,
            last_name: user.last_name,
            language_code: user.language_code,
            is_bot: user.is_bot,
            is_premium: user.is_premium,
            email: user.email,
            created_at: user.created_at,
            updated_at: user.updated_at,
            subscription_status: subscription.map(|s| s.status).unwrap_or_default(),
            subscription_provider: subscription.and_then(|s| s.provider.clone()),
            subscription_plan: subscription.and_then(|s| s.plan.clone()),
            subscription_activated_at: subscription.and_then(|s| s.activated_at),
            subscription_expires_at: subscription.and_then(|s| s.expires_at),
        }
    }
}

/// Input for creating a user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub telegram_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub is_premium: Option<bool>,
    #[serde(default)]
    pub email: Option<String>,
}

/// What a provider granted on activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionGrant {
    pub provider: String,
    pub plan: String,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
