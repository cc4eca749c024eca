//! HTTP middleware.
//!
//! - [`rate_limit`]: fixed-window request limits per client address

pub mod rate_limit;

pub use rate_limit::{RateLimitDecision, RateLimitLayer, RateLimitService, RateLimiter};
