//! Health check HTTP routes

use super::{HealthService, LivenessResponse};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

fn status_code(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health - `{status, db, redis, timestamp}`, 503 unless both checks pass
pub async fn health_check(State(service): State<Arc<HealthService>>) -> impl IntoResponse {
    let snapshot = service.snapshot().await;
    (status_code(snapshot.is_ok()), Json(snapshot))
}

/// GET /health/live - Liveness only, touches no dependency
pub async fn liveness_check() -> impl IntoResponse {
    (StatusCode::OK, Json(LivenessResponse::alive()))
}

/// GET /health/detailed - Snapshot plus per-component latency and errors
pub async fn detailed_health(State(service): State<Arc<HealthService>>) -> impl IntoResponse {
    let report = service.check_health().await;
    (status_code(report.snapshot.is_ok()), Json(report))
}
