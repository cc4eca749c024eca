//! Error handling for Perch Core.
//!
//! This module provides:
//! - A single error type carrying a machine-readable [`ErrorCode`]
//! - A coarse [`ErrorKind`] taxonomy used by callers to branch on failures
//! - HTTP status mapping and the wire payload `{statusCode, error, message, issues?}`
//! - User-facing messages kept separate from internal diagnostics
//! - Severity-aware logging and an error counter
//!
//! # Usage
//!
//! ```rust,ignore
//! use perch_core::error::{PerchError, Result};
//!
//! fn load(id: Uuid) -> Result<UserWithSubscription> {
//!     store.find_by_id(id).await?.ok_or_else(|| PerchError::user_not_found(id))
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Perch operations.
pub type Result<T> = std::result::Result<T, PerchError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Taxonomy
// ═══════════════════════════════════════════════════════════════════════════════

/// Which uniqueness rule a conflicting write broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Another user already has this external (Telegram) identifier
    DuplicateExternalId,
    /// Another user already has this email address
    DuplicateEmail,
    /// A uniqueness rule we could not attribute to a specific column
    Generic,
    /// The record is not in a state that allows the requested transition
    InvalidTransition,
}

/// Coarse classification of every error the service can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict(ConflictReason),
    Validation,
    RateLimited,
    QueueUnavailable,
    InternalConsistency,
    HandlerExecution,
    Internal,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// The string form returned by [`ErrorCode::as_str`] is what clients see in the
/// `error` field of the payload and is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Lookup
    UserNotFound,
    RouteNotFound,

    // Conflicts
    UserTelegramIdConflict,
    UserEmailConflict,
    UserConflict,
    SubscriptionNotActive,

    // Input
    ValidationError,
    RateLimitExceeded,

    // Queue
    QueueUnavailable,
    UnknownQueue,

    // Invariants
    UserSubscriptionNotFound,

    // Jobs
    HandlerExecutionFailed,

    // Infrastructure
    DatabaseError,
    DatabaseConnectionFailed,
    SerializationError,
    ConfigurationError,
    InternalError,
}

impl ErrorCode {
    /// Wire representation used in the `error` field of the payload.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::RouteNotFound => "NOT_FOUND",
            Self::UserTelegramIdConflict => "USER_TELEGRAM_ID_CONFLICT",
            Self::UserEmailConflict => "USER_EMAIL_CONFLICT",
            Self::UserConflict => "USER_CONFLICT",
            Self::SubscriptionNotActive => "SUBSCRIPTION_NOT_ACTIVE",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::QueueUnavailable => "QUEUE_UNAVAILABLE",
            Self::UserSubscriptionNotFound => "USER_SUBSCRIPTION_NOT_FOUND",
            Self::HandlerExecutionFailed => "HANDLER_EXECUTION_ERROR",
            // Everything below is reported to clients generically.
            Self::UnknownQueue
            | Self::DatabaseError
            | Self::DatabaseConnectionFailed
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::InternalError => "INTERNAL_SERVER_ERROR",
        }
    }

    /// The taxonomy bucket for this code.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UserNotFound | Self::RouteNotFound => ErrorKind::NotFound,
            Self::UserTelegramIdConflict => ErrorKind::Conflict(ConflictReason::DuplicateExternalId),
            Self::UserEmailConflict => ErrorKind::Conflict(ConflictReason::DuplicateEmail),
            Self::UserConflict => ErrorKind::Conflict(ConflictReason::Generic),
            Self::SubscriptionNotActive => ErrorKind::Conflict(ConflictReason::InvalidTransition),
            Self::ValidationError => ErrorKind::Validation,
            Self::RateLimitExceeded => ErrorKind::RateLimited,
            Self::QueueUnavailable => ErrorKind::QueueUnavailable,
            Self::UserSubscriptionNotFound => ErrorKind::InternalConsistency,
            Self::HandlerExecutionFailed => ErrorKind::HandlerExecution,
            Self::UnknownQueue
            | Self::DatabaseError
            | Self::DatabaseConnectionFailed
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::InternalError => ErrorKind::Internal,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::UserNotFound | Self::RouteNotFound => StatusCode::NOT_FOUND,

            Self::UserTelegramIdConflict
            | Self::UserEmailConflict
            | Self::UserConflict
            | Self::SubscriptionNotActive => StatusCode::CONFLICT,

            Self::ValidationError => StatusCode::BAD_REQUEST,

            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,

            Self::QueueUnavailable | Self::DatabaseConnectionFailed => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            Self::UnknownQueue
            | Self::UserSubscriptionNotFound
            | Self::HandlerExecutionFailed
            | Self::DatabaseError
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a job that failed with this code is worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueUnavailable
                | Self::DatabaseConnectionFailed
                | Self::DatabaseError
                | Self::HandlerExecutionFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller mistakes (bad input, missing records, conflicts)
    Low,
    /// Operational issues (queue outage, handler failures)
    Medium,
    /// System errors
    High,
    /// Broken invariants
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code.kind() {
            ErrorKind::NotFound
            | ErrorKind::Conflict(_)
            | ErrorKind::Validation
            | ErrorKind::RateLimited => Self::Low,
            ErrorKind::QueueUnavailable | ErrorKind::HandlerExecution => Self::Medium,
            ErrorKind::Internal => Self::High,
            ErrorKind::InternalConsistency => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// One rejected input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted path of the offending field (`"email"`, `"params.id"`)
    pub path: String,
    /// Human readable explanation
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Field-level validation failures, surfaced as `issues`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ValidationIssue>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Related entity ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Additional context key-value pairs (logged, never sent)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_issues(mut self, issues: Vec<ValidationIssue>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Perch Core.
#[derive(Error, Debug)]
pub struct PerchError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for PerchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl PerchError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "Internal server error", message)
    }

    /// The user does not exist.
    pub fn user_not_found(id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::UserNotFound, "User not found")
            .with_details(ErrorDetails::new().with_entity("user", id.to_string()))
    }

    /// Request input was rejected before reaching the service layer.
    pub fn validation(issues: Vec<ValidationIssue>) -> Self {
        Self::new(ErrorCode::ValidationError, "Validation failed")
            .with_details(ErrorDetails::new().with_issues(issues))
    }

    /// A uniqueness rule was broken while creating a user.
    pub fn conflict(reason: ConflictReason) -> Self {
        match reason {
            ConflictReason::DuplicateExternalId => Self::new(
                ErrorCode::UserTelegramIdConflict,
                "User with this telegram id already exists",
            ),
            ConflictReason::DuplicateEmail => Self::new(
                ErrorCode::UserEmailConflict,
                "User with this email already exists",
            ),
            ConflictReason::Generic => Self::new(ErrorCode::UserConflict, "User already exists"),
            ConflictReason::InvalidTransition => Self::new(
                ErrorCode::SubscriptionNotActive,
                "Subscription is not active",
            ),
        }
    }

    /// The user exists but its subscription row is gone.
    pub fn missing_subscription(user_id: impl fmt::Display) -> Self {
        Self::with_internal(
            ErrorCode::UserSubscriptionNotFound,
            "User subscription not found",
            format!("user {} has no user_subscriptions row", user_id),
        )
        .with_details(ErrorDetails::new().with_entity("user", user_id.to_string()))
    }

    /// The queue backend could not be reached.
    pub fn queue_unavailable(internal: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::QueueUnavailable,
            "Job queue is unavailable",
            internal,
        )
    }

    /// A job was routed to a queue nobody registered.
    pub fn unknown_queue(queue: &str) -> Self {
        Self::with_internal(
            ErrorCode::UnknownQueue,
            "Internal server error",
            format!("no handler registered for queue '{}'", queue),
        )
    }

    /// The client used up its request budget for the current window.
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(
            ErrorCode::RateLimitExceeded,
            format!("Rate limit exceeded, retry in {} seconds", retry_after_secs),
        )
        .with_context("retry_after_secs", retry_after_secs)
    }

    /// Invalid startup configuration.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Internal server error",
            message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "invariant violated"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    http_status = status,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "request failed"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    http_status = status,
                    internal_message = ?self.internal_message,
                    "request degraded"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    http_status = status,
                    user_message = %self.user_message,
                    "request rejected"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "perch_errors_total",
            "code" => self.code.as_str(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error payload returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub status_code: u16,
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<ValidationIssue>>,
}

impl From<&PerchError> for ErrorPayload {
    fn from(error: &PerchError) -> Self {
        let status = error.http_status();
        let message = match error.kind() {
            // Never leak internals for unexpected failures.
            ErrorKind::Internal => "Internal server error".to_string(),
            _ => error.user_message.to_string(),
        };
        let issues = if error.details.issues.is_empty() {
            None
        } else {
            Some(error.details.issues.clone())
        };

        Self {
            status_code: status.as_u16(),
            error: error.code.as_str().to_string(),
            message,
            issues,
        }
    }
}

impl IntoResponse for PerchError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let payload = ErrorPayload::from(&self);

        (status, Json(payload)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for PerchError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                let constraint = db_err.constraint().unwrap_or_default().to_string();
                let reason = conflict_reason_for_constraint(&constraint);
                return Self::conflict(reason)
                    .with_context("constraint", constraint)
                    .with_source(error);
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

/// Attribute a unique constraint name to the column it protects.
pub fn conflict_reason_for_constraint(constraint: &str) -> ConflictReason {
    if constraint.contains("telegram_id") {
        ConflictReason::DuplicateExternalId
    } else if constraint.contains("email") {
        ConflictReason::DuplicateEmail
    } else {
        ConflictReason::Generic
    }
}

impl From<sqlx::migrate::MigrateError> for PerchError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::DatabaseError,
            "A database error occurred",
            format!("migration failed: {}", error),
        )
        .with_source(error)
    }
}

impl From<redis::RedisError> for PerchError {
    fn from(error: redis::RedisError) -> Self {
        Self::queue_unavailable(error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for PerchError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for PerchError {
    fn from(error: config::ConfigError) -> Self {
        Self::configuration(error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for PerchError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "Internal server error", error.to_string())
            .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_codes() {
        assert_eq!(
            PerchError::conflict(ConflictReason::DuplicateExternalId).code().as_str(),
            "USER_TELEGRAM_ID_CONFLICT"
        );
        assert_eq!(
            PerchError::conflict(ConflictReason::DuplicateEmail).code().as_str(),
            "USER_EMAIL_CONFLICT"
        );
        assert_eq!(
            PerchError::conflict(ConflictReason::Generic).http_status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_constraint_attribution() {
        assert_eq!(
            conflict_reason_for_constraint("users_telegram_id_unique"),
            ConflictReason::DuplicateExternalId
        );
        assert_eq!(
            conflict_reason_for_constraint("users_email_unique"),
            ConflictReason::DuplicateEmail
        );
        assert_eq!(conflict_reason_for_constraint("users_pkey"), ConflictReason::Generic);
    }

    #[test]
    fn test_missing_subscription_is_consistency_error() {
        let err = PerchError::missing_subscription("abc");
        assert_eq!(err.kind(), ErrorKind::InternalConsistency);
        assert_eq!(err.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code().as_str(), "USER_SUBSCRIPTION_NOT_FOUND");
        assert_eq!(err.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_rate_limited_payload() {
        let payload = ErrorPayload::from(&PerchError::rate_limited(42));
        assert_eq!(payload.status_code, 429);
        assert_eq!(payload.error, "RATE_LIMIT_EXCEEDED");
        assert_eq!(payload.message, "Rate limit exceeded, retry in 42 seconds");
    }

    #[test]
    fn test_internal_payload_does_not_leak() {
        let err = PerchError::internal("connection string postgres://secret@db");
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.status_code, 500);
        assert_eq!(payload.error, "INTERNAL_SERVER_ERROR");
        assert_eq!(payload.message, "Internal server error");
        assert!(payload.issues.is_none());
    }

    #[test]
    fn test_validation_payload_carries_issues() {
        let err = PerchError::validation(vec![ValidationIssue::new("telegramId", "must be positive")]);
        let json = serde_json::to_value(ErrorPayload::from(&err)).unwrap();
        assert_eq!(json["statusCode"], 400);
        assert_eq!(json["error"], "VALIDATION_ERROR");
        assert_eq!(json["issues"][0]["path"], "telegramId");
    }

    #[test]
    fn test_redis_error_maps_to_queue_unavailable() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::IoError, "connection refused"));
        let err = PerchError::from(redis_err);
        assert_eq!(err.kind(), ErrorKind::QueueUnavailable);
        assert!(err.is_retryable());
    }
}
