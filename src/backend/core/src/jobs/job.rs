//! Job definitions and execution policy.
//!
//! This module provides the core value types of the job system:
//!
//! - **JobId**: identity of a queued job
//! - **JobError**: handler failure, tagged retryable or fatal
//! - **BackoffStrategy / ExecutionPolicy**: how a queue retries and how wide it runs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ErrorKind, PerchError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether this error is retryable
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<PerchError> for JobError {
    fn from(error: PerchError) -> Self {
        // Missing records and bad input will not fix themselves on retry.
        let retryable = !matches!(
            error.kind(),
            ErrorKind::NotFound | ErrorKind::Validation | ErrorKind::Conflict(_)
        );
        let message = match error.internal_message() {
            Some(internal) => format!("{}: {}", error.user_message(), internal),
            None => error.user_message().to_string(),
        };
        Self {
            message,
            retryable,
            code: Some(error.code().as_str().to_string()),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        Self::fatal(format!("invalid payload: {}", error)).with_code("INVALID_PAYLOAD")
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays from the policy's base and cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always wait `base_delay`
    Fixed,
    /// Wait `base_delay * 2^(attempt - 1)`, capped at `max_delay`
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

impl BackoffStrategy {
    /// Delay before re-delivering a job whose `attempt`-th delivery failed (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32, base: Duration, max: Duration) -> Duration {
        let delay = match self {
            Self::Fixed => base,
            Self::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent).unwrap_or(max)
            }
        };
        delay.min(max)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// How a queue's jobs are executed and retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Total deliveries allowed before a job is dead-lettered (>= 1)
    pub max_attempts: u32,
    /// Retry delay strategy
    pub backoff: BackoffStrategy,
    /// First retry delay
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Retry delay cap
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Executors running this queue (>= 1)
    pub concurrency: usize,
    /// Payload field whose value serializes jobs in-process
    pub per_key: Option<String>,
    /// Handler deadline; a timed out delivery counts as a retryable failure
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            concurrency: 1,
            per_key: None,
            timeout: None,
        }
    }
}

impl ExecutionPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy, base: Duration, max: Duration) -> Self {
        self.backoff = backoff;
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_per_key(mut self, field: impl Into<String>) -> Self {
        self.per_key = Some(field.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay before the next delivery after `attempt` failed.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.backoff
            .delay_for_attempt(attempt, self.base_delay, self.max_delay)
    }

    /// Whether a failure on delivery `attempt` gets another delivery.
    pub fn should_retry(&self, attempt: u32, error: &JobError) -> bool {
        error.retryable && attempt < self.max_attempts
    }

    /// Reject policies that could never run a job.
    pub fn validate(&self, queue: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PerchError::configuration(format!(
                "queue '{}': max_attempts must be at least 1",
                queue
            )));
        }
        if self.concurrency == 0 {
            return Err(PerchError::configuration(format!(
                "queue '{}': concurrency must be at least 1",
                queue
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(PerchError::configuration(format!(
                "queue '{}': base_delay exceeds max_delay",
                queue
            )));
        }
        if matches!(self.per_key.as_deref(), Some("")) {
            return Err(PerchError::configuration(format!(
                "queue '{}': per_key field name is empty",
                queue
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let strategy = BackoffStrategy::Fixed;
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(strategy.delay_for_attempt(1, base, max), base);
        assert_eq!(strategy.delay_for_attempt(7, base, max), base);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let strategy = BackoffStrategy::Exponential;
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        assert_eq!(strategy.delay_for_attempt(1, base, max), Duration::from_millis(100));
        assert_eq!(strategy.delay_for_attempt(2, base, max), Duration::from_millis(200));
        assert_eq!(strategy.delay_for_attempt(3, base, max), Duration::from_millis(400));
        assert_eq!(strategy.delay_for_attempt(5, base, max), max);
        assert_eq!(strategy.delay_for_attempt(200, base, max), max);
    }

    #[test]
    fn test_should_retry() {
        let policy = ExecutionPolicy::default().with_max_attempts(3);
        let err = JobError::retryable("boom");
        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(2, &err));
        assert!(!policy.should_retry(3, &err));
        assert!(!policy.should_retry(1, &JobError::fatal("nope")));
    }

    #[test]
    fn test_policy_validation() {
        assert!(ExecutionPolicy::default().validate("q").is_ok());
        assert!(ExecutionPolicy::default().with_max_attempts(0).validate("q").is_err());
        assert!(ExecutionPolicy::default().with_concurrency(0).validate("q").is_err());
        assert!(ExecutionPolicy::default().with_per_key("").validate("q").is_err());
    }

    #[test]
    fn test_not_found_is_fatal() {
        let err: JobError = PerchError::user_not_found("abc").into();
        assert!(!err.retryable);
        assert_eq!(err.code.as_deref(), Some("USER_NOT_FOUND"));
    }
}
