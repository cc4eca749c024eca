//! PostgreSQL implementation of [`UserStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::users::{NewUser, Subscription, SubscriptionGrant, User, UserStore, UserWithSubscription};

const PROJECTION: &str = r#"
    SELECT
        u.id, u.telegram_id, u.username, u.first_name, u.last_name, u.language_code,
        u.is_bot, u.is_premium, u.email, u.created_at, u.updated_at,
        COALESCE(s.subscription_status, 'inactive'::subscription_status) AS subscription_status,
        s.subscription_provider,
        s.subscription_plan,
        s.subscription_activated_at,
        s.subscription_expires_at
    FROM users u
    LEFT JOIN user_subscriptions s ON s.user_id = u.id
"#;

/// User store backed by the `users` and `user_subscriptions` tables.
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn list(&self) -> Result<Vec<UserWithSubscription>> {
        let rows = sqlx::query_as::<_, UserWithSubscription>(&format!(
            "{} ORDER BY u.created_at, u.id",
            PROJECTION
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserWithSubscription>> {
        let row = sqlx::query_as::<_, UserWithSubscription>(&format!("{} WHERE u.id = $1", PROJECTION))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn user_exists(&self, id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn telegram_id_exists(&self, telegram_id: i64) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE telegram_id = $1)")
            .bind(telegram_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn subscription(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>("SELECT * FROM user_subscriptions WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn create(&self, new_user: &NewUser) -> Result<UserWithSubscription> {
        let mut tx = self.pool.begin().await?;

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (telegram_id, username, first_name, last_name, language_code, is_bot, is_premium, email)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(new_user.telegram_id)
        .bind(&new_user.username)
        .bind(&new_user.first_name)
        .bind(&new_user.last_name)
        .bind(&new_user.language_code)
        .bind(new_user.is_bot.unwrap_or(false))
        .bind(new_user.is_premium.unwrap_or(false))
        .bind(&new_user.email)
        .fetch_one(&mut *tx)
        .await?;

        let subscription = sqlx::query_as::<_, Subscription>(
            "INSERT INTO user_subscriptions (user_id) VALUES ($1) RETURNING *",
        )
        .bind(user.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(UserWithSubscription::from_parts(user, Some(&subscription)))
    }

    async fn activate_subscription(&self, user_id: Uuid, grant: &SubscriptionGrant) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE user_subscriptions
            SET subscription_status = 'active',
                subscription_provider = $2,
                subscription_plan = $3,
                subscription_activated_at = $4,
                subscription_expires_at = $5,
                updated_at = now()
            WHERE user_id = $1
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(&grant.provider)
        .bind(&grant.plan)
        .bind(grant.activated_at)
        .bind(grant.expires_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn cancel_subscription(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE user_subscriptions
            SET subscription_status = 'canceled', updated_at = $2
            WHERE user_id = $1 AND subscription_status = 'active'
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn expire_subscription(
        &self,
        user_id: Uuid,
        expected_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET subscription_status = 'expired', updated_at = $3
            WHERE user_id = $1
              AND subscription_status = 'active'
              AND subscription_expires_at = $2
              AND subscription_expires_at <= $3
            "#,
        )
        .bind(user_id)
        .bind(expected_expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
