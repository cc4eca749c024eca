//! HTTP-level tests for the REST API.
//!
//! Tests cover:
//! - User creation, lookup and listing
//! - Validation and malformed bodies
//! - Conflict, not-found and unknown-route payloads
//! - Subscription activation, cancellation and queued activation
//! - Health endpoints, including failing and hanging dependency checks
//! - Rate limiting and its `/health` exemption

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use perch_core::api::{build_router, AppState};
use perch_core::health::{
    ComponentHealth, HealthChecker, HealthConfig, HealthService, QueueHealthChecker, StoreHealthChecker,
};
use perch_core::config::RateLimitSettings;
use perch_core::jobs::{InMemoryQueueStore, QueueStore, ACTIVATE_QUEUE};
use perch_core::middleware::RateLimiter;
use perch_core::users::{InMemoryUserStore, MockPaymentProvider, SubscriptionService, UserStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

// ============================================================================
// Helpers
// ============================================================================

struct TestApp {
    router: Router,
    state: AppState,
    store: Arc<InMemoryUserStore>,
    queue: Arc<InMemoryQueueStore>,
}

fn app_with(health_timeout: Duration, redis: Option<Arc<dyn HealthChecker>>) -> TestApp {
    let store = Arc::new(InMemoryUserStore::new());
    let queue = Arc::new(InMemoryQueueStore::new());
    let service = Arc::new(
        SubscriptionService::new(store.clone(), Arc::new(MockPaymentProvider)).with_queue(queue.clone()),
    );
    let redis: Arc<dyn HealthChecker> = match redis {
        Some(checker) => checker,
        None => Arc::new(QueueHealthChecker::new(queue.clone())),
    };
    let health = Arc::new(HealthService::new(
        HealthConfig {
            check_timeout: health_timeout,
        },
        Arc::new(StoreHealthChecker::new(store.clone())),
        redis,
    ));

    let state = AppState::new(service, health);
    TestApp {
        router: build_router(state.clone()),
        state,
        store,
        queue,
    }
}

fn app() -> TestApp {
    app_with(Duration::from_secs(2), None)
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    send_request(router, request).await
}

async fn send_request(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn create(router: &Router, body: Value) -> (StatusCode, Value) {
    send(router, Method::POST, "/api/v1/users", Some(body)).await
}

fn user_body(telegram_id: i64) -> Value {
    json!({
        "telegramId": telegram_id,
        "firstName": "Ada",
        "username": "ada",
        "languageCode": "en",
    })
}

// ============================================================================
// User Tests
// ============================================================================

#[tokio::test]
async fn test_create_user_returns_201() {
    let app = app();
    let (status, body) = create(&app.router, user_body(42)).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["telegramId"], 42);
    assert_eq!(body["firstName"], "Ada");
    assert_eq!(body["subscriptionStatus"], "inactive");
    assert_eq!(body["subscriptionExpiresAt"], Value::Null);
    assert!(Uuid::parse_str(body["id"].as_str().unwrap()).is_ok());
}

#[tokio::test]
async fn test_get_and_list_users() {
    let app = app();
    let (_, created) = create(&app.router, user_body(1)).await;
    let id = created["id"].as_str().unwrap();

    let (status, fetched) = send(&app.router, Method::GET, &format!("/api/v1/users/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, created);

    let (status, list) = send(&app.router, Method::GET, "/api/v1/users", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_validation_failure_lists_issues() {
    let app = app();
    let (status, body) = create(&app.router, json!({"telegramId": 0, "email": "nope"})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["statusCode"], 400);
    assert_eq!(body["error"], "VALIDATION_ERROR");
    let paths: Vec<&str> = body["issues"]
        .as_array()
        .unwrap()
        .iter()
        .map(|issue| issue["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["telegramId", "firstName", "email"]);
    assert!(app.store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_json_is_validation_error() {
    let app = app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/users")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"telegramId\": "))
        .unwrap();

    let (status, body) = send_request(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");
    assert_eq!(body["issues"][0]["path"], "body");
}

#[tokio::test]
async fn test_duplicate_telegram_id_returns_409() {
    let app = app();
    create(&app.router, user_body(9)).await;
    let (status, body) = create(&app.router, user_body(9)).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "USER_TELEGRAM_ID_CONFLICT");
    assert!(body.get("issues").is_none());
}

#[tokio::test]
async fn test_unknown_user_returns_404() {
    let app = app();
    let uri = format!("/api/v1/users/{}", Uuid::new_v4());
    let (status, body) = send(&app.router, Method::GET, &uri, None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "USER_NOT_FOUND");
    assert_eq!(body["message"], "User not found");
}

#[tokio::test]
async fn test_invalid_user_id_returns_400() {
    let app = app();
    let (status, body) = send(&app.router, Method::GET, "/api/v1/users/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_unknown_route_uses_error_payload() {
    let app = app();
    let (status, body) = send(&app.router, Method::GET, "/api/v1/nothing-here", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["statusCode"], 404);
    assert_eq!(body["error"], "NOT_FOUND");
}

#[tokio::test]
async fn test_store_outage_hides_internals() {
    let app = app();
    app.store.set_unavailable(true);
    let (status, body) = send(&app.router, Method::GET, "/api/v1/users", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!body["message"].as_str().unwrap().contains("pool"));
}

// ============================================================================
// Subscription Tests
// ============================================================================

#[tokio::test]
async fn test_activate_then_cancel() {
    let app = app();
    let (_, created) = create(&app.router, user_body(5)).await;
    let id = created["id"].as_str().unwrap();

    let (status, active) = send(
        &app.router,
        Method::POST,
        &format!("/api/v1/users/{}/subscription/activate", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(active["subscriptionStatus"], "active");
    assert_eq!(active["subscriptionProvider"], "mock-payment-provider");
    assert_eq!(active["subscriptionPlan"], "premium");
    assert!(active["subscriptionExpiresAt"].is_string());

    let (status, canceled) = send(
        &app.router,
        Method::POST,
        &format!("/api/v1/users/{}/subscription/cancel", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(canceled["subscriptionStatus"], "canceled");

    let (status, body) = send(
        &app.router,
        Method::POST,
        &format!("/api/v1/users/{}/subscription/cancel", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "SUBSCRIPTION_NOT_ACTIVE");
}

#[tokio::test]
async fn test_activate_unknown_user_returns_404() {
    let app = app();
    let uri = format!("/api/v1/users/{}/subscription/activate", Uuid::new_v4());
    let (status, body) = send(&app.router, Method::POST, &uri, None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "USER_NOT_FOUND");
}

#[tokio::test]
async fn test_missing_subscription_returns_500_with_code() {
    let app = app();
    let (_, created) = create(&app.router, user_body(5)).await;
    let id: Uuid = created["id"].as_str().unwrap().parse().unwrap();
    app.store.remove_subscription(id);

    let uri = format!("/api/v1/users/{}/subscription/activate", id);
    let (status, body) = send(&app.router, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "USER_SUBSCRIPTION_NOT_FOUND");
}

#[tokio::test]
async fn test_activation_job_is_accepted() {
    let app = app();
    let (_, created) = create(&app.router, user_body(5)).await;
    let id = created["id"].as_str().unwrap();

    let uri = format!("/api/v1/users/{}/subscription/activation-jobs", id);
    let (status, body) = send(&app.router, Method::POST, &uri, None).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["queue"], ACTIVATE_QUEUE);
    assert!(body["jobId"].is_string());
    assert_eq!(app.queue.stats(ACTIVATE_QUEUE).await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_activation_job_when_queue_down_returns_503() {
    let app = app();
    let (_, created) = create(&app.router, user_body(5)).await;
    let id = created["id"].as_str().unwrap();
    app.queue.set_unavailable(true);

    let uri = format!("/api/v1/users/{}/subscription/activation-jobs", id);
    let (status, body) = send(&app.router, Method::POST, &uri, None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "QUEUE_UNAVAILABLE");
}

// ============================================================================
// Health Tests
// ============================================================================

struct HangingChecker;

#[async_trait]
impl HealthChecker for HangingChecker {
    fn name(&self) -> &str {
        "redis"
    }

    async fn check(&self) -> ComponentHealth {
        std::future::pending::<()>().await;
        ComponentHealth::ok("redis")
    }
}

#[tokio::test]
async fn test_health_ok() {
    let app = app();
    let (status, body) = send(&app.router, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db"], "ok");
    assert_eq!(body["redis"], "ok");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_health_reports_failed_dependency() {
    let app = app();
    app.queue.set_unavailable(true);
    let (status, body) = send(&app.router, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "error");
    assert_eq!(body["db"], "ok");
    assert_eq!(body["redis"], "error");
}

#[tokio::test]
async fn test_health_times_out_hanging_check() {
    let app = app_with(Duration::from_millis(50), Some(Arc::new(HangingChecker)));

    let (status, body) = tokio::time::timeout(
        Duration::from_secs(2),
        send(&app.router, Method::GET, "/health", None),
    )
    .await
    .expect("health check must be bounded");

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["db"], "ok");
    assert_eq!(body["redis"], "error");
}

#[tokio::test]
async fn test_detailed_health_includes_components() {
    let app = app();
    let (status, body) = send(&app.router, Method::GET, "/health/detailed", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["components"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_liveness_skips_dependencies() {
    let app = app();
    app.store.set_unavailable(true);
    let (status, _) = send(&app.router, Method::GET, "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_without_recorder() {
    let app = app();
    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Rate Limit Tests
// ============================================================================

fn limited_app(max: u64) -> TestApp {
    let app = app();
    let limiter = Arc::new(RateLimiter::in_memory(RateLimitSettings {
        enabled: true,
        max,
        window_ms: 60_000,
    }));
    let state = app.state.clone().with_rate_limiter(limiter);
    TestApp {
        router: build_router(state.clone()),
        state,
        ..app
    }
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().method(Method::GET).uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_rate_limit_rejects_with_error_payload() {
    let app = limited_app(2);

    for remaining in ["1", "0"] {
        let response = app.router.clone().oneshot(get_request("/api/v1/users")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
        assert!(response.headers().contains_key("x-ratelimit-reset"));
    }

    let response = app.router.clone().oneshot(get_request("/api/v1/users")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["statusCode"], 429);
    assert_eq!(body["error"], "RATE_LIMIT_EXCEEDED");
    assert!(body["message"].as_str().unwrap().starts_with("Rate limit exceeded"));
    assert!(body.get("issues").is_none());
}

#[tokio::test]
async fn test_health_is_exempt_from_rate_limit() {
    let app = limited_app(1);

    for uri in ["/health", "/health/live", "/health/detailed", "/health"] {
        let response = app.router.clone().oneshot(get_request(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
    }

    // The budget is untouched by the health calls.
    let (status, _) = send(&app.router, Method::GET, "/api/v1/users", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app.router, Method::GET, "/api/v1/users", None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["statusCode"], 429);
}
