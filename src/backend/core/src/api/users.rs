//! `/api/v1/users` handlers.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::validation::{json_rejection, parse_user_id, validate_new_user};
use crate::error::Result;
use crate::jobs::JobId;
use crate::users::{SubscriptionService, UserWithSubscription};

/// Body of `202 Accepted` responses.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedJob {
    pub job_id: JobId,
    pub queue: String,
}

/// GET /api/v1/users
pub async fn list_users(
    State(service): State<Arc<SubscriptionService>>,
) -> Result<Json<Vec<UserWithSubscription>>> {
    Ok(Json(service.list().await?))
}

/// GET /api/v1/users/:id
pub async fn get_user(
    State(service): State<Arc<SubscriptionService>>,
    Path(id): Path<String>,
) -> Result<Json<UserWithSubscription>> {
    let id = parse_user_id(&id)?;
    Ok(Json(service.get_by_id(id).await?))
}

/// POST /api/v1/users
pub async fn create_user(
    State(service): State<Arc<SubscriptionService>>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<UserWithSubscription>)> {
    let Json(body) = body.map_err(json_rejection)?;
    let new_user = validate_new_user(&body)?;
    let user = service.create(new_user).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// POST /api/v1/users/:id/subscription/activate
pub async fn activate_subscription(
    State(service): State<Arc<SubscriptionService>>,
    Path(id): Path<String>,
) -> Result<Json<UserWithSubscription>> {
    let id = parse_user_id(&id)?;
    Ok(Json(service.activate(id).await?))
}

/// POST /api/v1/users/:id/subscription/cancel
pub async fn cancel_subscription(
    State(service): State<Arc<SubscriptionService>>,
    Path(id): Path<String>,
) -> Result<Json<UserWithSubscription>> {
    let id = parse_user_id(&id)?;
    Ok(Json(service.cancel(id).await?))
}

/// POST /api/v1/users/:id/subscription/activation-jobs
///
/// Queues the activation; 503 if the queue is down since nothing else would run it.
pub async fn enqueue_activation(
    State(service): State<Arc<SubscriptionService>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<AcceptedJob>)> {
    let id = parse_user_id(&id)?;
    let handle = service.enqueue_activation(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedJob {
            job_id: handle.job_id,
            queue: handle.queue,
        }),
    ))
}
