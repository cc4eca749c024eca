//! Health check definitions and status types.
//!
//! This module provides:
//! - `CheckStatus`, the two-valued result of one dependency check
//! - `ComponentHealth` for an individual dependency result with timing
//! - `HealthSnapshot`, the `{status, db, redis, timestamp}` body of `GET /health`
//! - `HealthReport`, the snapshot plus per-component detail
//!
//! # Example
//!
//! ```rust,ignore
//! use perch_core::health::{ComponentHealth, HealthReport};
//!
//! let report = HealthReport::from_components(
//!     ComponentHealth::ok("db").with_latency_ms(3),
//!     ComponentHealth::error("redis", "connection refused"),
//! );
//! assert!(!report.snapshot.is_ok());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Check Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of one dependency check, or of the whole check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    #[default]
    Ok,
    Error,
}

impl CheckStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// `Ok` only if both are `Ok`.
    pub fn combine(self, other: Self) -> Self {
        if self.is_ok() && other.is_ok() {
            Self::Ok
        } else {
            Self::Error
        }
    }

    pub fn to_http_status(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Error => 503,
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Component Health
// ═══════════════════════════════════════════════════════════════════════════════

/// Health information for a single dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,

    /// Check result
    pub status: CheckStatus,

    /// Latency of the check in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the check finished
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            latency_ms: None,
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn error(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            latency_ms: None,
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }

    /// Create from a check result.
    pub fn from_result<E: std::fmt::Display>(
        name: impl Into<String>,
        result: Result<(), E>,
        latency: Duration,
    ) -> Self {
        match result {
            Ok(()) => Self::ok(name).with_latency(latency),
            Err(e) => Self::error(name, e.to_string()).with_latency(latency),
        }
    }

    /// Add latency from Duration.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    /// Add latency in milliseconds.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot & Report
// ═══════════════════════════════════════════════════════════════════════════════

/// Composite status of the backing services. Computed per request, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// `ok` only if both checks are `ok`
    pub status: CheckStatus,
    pub db: CheckStatus,
    pub redis: CheckStatus,
    pub timestamp: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn new(db: CheckStatus, redis: CheckStatus) -> Self {
        Self {
            status: db.combine(redis),
            db,
            redis,
            timestamp: Utc::now(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Snapshot plus the component detail it was derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,

    /// Service version
    pub version: String,

    /// Uptime in seconds
    pub uptime_secs: u64,

    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn from_components(db: ComponentHealth, redis: ComponentHealth) -> Self {
        Self {
            snapshot: HealthSnapshot::new(db.status, redis.status),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: 0,
            components: vec![db, redis],
        }
    }

    /// Set the uptime.
    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime_secs = uptime.as_secs();
        self
    }
}

/// Liveness response: the process is up and serving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub timestamp: DateTime<Utc>,
}

impl LivenessResponse {
    pub fn alive() -> Self {
        Self {
            alive: true,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_combination() {
        assert_eq!(CheckStatus::Ok.combine(CheckStatus::Ok), CheckStatus::Ok);
        assert_eq!(CheckStatus::Ok.combine(CheckStatus::Error), CheckStatus::Error);
        assert_eq!(CheckStatus::Error.combine(CheckStatus::Ok), CheckStatus::Error);
    }

    #[test]
    fn test_snapshot_shape() {
        let snapshot = HealthSnapshot::new(CheckStatus::Ok, CheckStatus::Error);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["db"], "ok");
        assert_eq!(json["redis"], "error");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_report_flattens_snapshot() {
        let report = HealthReport::from_components(
            ComponentHealth::ok("db").with_latency_ms(3),
            ComponentHealth::error("redis", "connection refused"),
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["components"][1]["error"], "connection refused");
    }
}
