//! User profiles and the subscription lifecycle.
//!
//! - **model**: rows, the client projection, and creation input
//! - **store**: the [`UserStore`] persistence seam plus an in-memory implementation
//! - **provider**: the payment provider seam (mocked)
//! - **service**: [`SubscriptionService`], the only writer of subscription state

pub mod model;
pub mod provider;
pub mod service;
pub mod store;

pub use model::{NewUser, Subscription, SubscriptionGrant, SubscriptionStatus, User, UserWithSubscription};
pub use provider::{MockPaymentProvider, SubscriptionProvider, SUBSCRIPTION_PERIOD_MS};
pub use service::{ExpiryOutcome, SubscriptionService};
pub use store::{InMemoryUserStore, UserStore};
