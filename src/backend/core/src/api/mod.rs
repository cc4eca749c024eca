//! HTTP API for Perch.
//!
//! # Routes
//!
//! - `GET  /health`, `/health/live`, `/health/detailed` - dependency checks (unversioned)
//! - `GET  /metrics` - Prometheus exposition (unversioned)
//! - `GET  /api/v1/users`, `GET /api/v1/users/:id`, `POST /api/v1/users`
//! - `POST /api/v1/users/:id/subscription/activate`
//! - `POST /api/v1/users/:id/subscription/cancel`
//! - `POST /api/v1/users/:id/subscription/activation-jobs`
//!
//! Every failure, including unknown routes, answers with
//! `{statusCode, error, message, issues?}`. Everything except `/health*` is
//! subject to the per-client rate limit when one is configured.

pub mod users;
pub mod validation;

use axum::{
    extract::{FromRef, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::error::{ErrorCode, PerchError};
use crate::health::{detailed_health, health_check, liveness_check, HealthService};
use crate::middleware::{RateLimitLayer, RateLimiter};
use crate::users::SubscriptionService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<SubscriptionService>,
    pub health: Arc<HealthService>,
    /// `None` when no recorder is installed, e.g. in tests.
    pub metrics: Option<PrometheusHandle>,
    /// `None` leaves every route unlimited.
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl AppState {
    pub fn new(users: Arc<SubscriptionService>, health: Arc<HealthService>) -> Self {
        Self {
            users,
            health,
            metrics: None,
            rate_limiter: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }
}

impl FromRef<AppState> for Arc<SubscriptionService> {
    fn from_ref(state: &AppState) -> Self {
        state.users.clone()
    }
}

impl FromRef<AppState> for Arc<HealthService> {
    fn from_ref(state: &AppState) -> Self {
        state.health.clone()
    }
}

/// Build the API router.
///
/// ```rust,ignore
/// let state = AppState::new(service, health)
///     .with_metrics(handle)
///     .with_rate_limiter(limiter);
/// let app = build_router(state);
/// ```
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        // Unversioned endpoints
        .route("/health", get(health_check))
        .route("/health/live", get(liveness_check))
        .route("/health/detailed", get(detailed_health))
        .route("/metrics", get(prometheus_metrics))
        .nest("/api/v1", v1_router())
        .fallback(route_not_found);

    if let Some(limiter) = state.rate_limiter.clone() {
        router = router.layer(RateLimitLayer::new(limiter));
    }

    router
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/users", get(users::list_users).post(users::create_user))
        .route("/users/:id", get(users::get_user))
        .route(
            "/users/:id/subscription/activate",
            post(users::activate_subscription),
        )
        .route(
            "/users/:id/subscription/cancel",
            post(users::cancel_subscription),
        )
        .route(
            "/users/:id/subscription/activation-jobs",
            post(users::enqueue_activation),
        )
}

/// GET /metrics
async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            String::from("metrics recorder not installed\n"),
        ),
    }
}

async fn route_not_found() -> PerchError {
    PerchError::new(ErrorCode::RouteNotFound, "Route not found")
}
