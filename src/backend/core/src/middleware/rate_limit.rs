//! Rate limiting middleware.
//!
//! Every client address gets `max` requests per fixed window of `window_ms`.
//! Counters live in Redis so that all server instances share one budget;
//! without Redis they are kept in process.
//!
//! Successful responses carry `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
//! `X-RateLimit-Reset` (seconds until the window resets). Rejected requests get
//! `429` with the standard error payload and a `Retry-After` header.
//!
//! If the counter store fails, the request is let through unlimited. `/health`
//! and everything beneath it is never limited.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, HeaderValue, Request},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use futures::future::BoxFuture;
use metrics::counter;
use redis::aio::ConnectionManager;
use redis::Script;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use crate::config::RateLimitSettings;
use crate::error::{PerchError, Result};

/// Paths under this prefix bypass the limiter.
const EXEMPT_PREFIX: &str = "/health";

/// In-process windows are swept once the map grows past this many clients.
const LOCAL_SWEEP_THRESHOLD: usize = 10_000;

/// Counts one hit and returns `{count, ms until reset}`.
const HIT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {current, ttl}
"#;

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the current window resets
    pub reset_after: Duration,
}

impl RateLimitDecision {
    fn from_count(limit: u64, count: u64, reset_after: Duration) -> Self {
        Self {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_after,
        }
    }

    /// Whole seconds until reset, at least one.
    pub fn reset_secs(&self) -> u64 {
        let millis = self.reset_after.as_millis() as u64;
        millis.div_ceil(1000).max(1)
    }

    fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("X-RateLimit-Limit", HeaderValue::from(self.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(self.remaining));
        headers.insert("X-RateLimit-Reset", HeaderValue::from(self.reset_secs()));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Limiter
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    started: Instant,
    count: u64,
}

enum Counters {
    Redis {
        conn: ConnectionManager,
        prefix: String,
        script: Script,
    },
    Local(DashMap<String, LocalWindow>),
}

/// Counts requests per client and decides whether to let them through.
pub struct RateLimiter {
    settings: RateLimitSettings,
    counters: Counters,
}

impl RateLimiter {
    /// Share counters with every instance through Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL
    /// * `prefix` - Namespace for the counter keys
    /// * `settings` - Budget per window
    pub async fn connect(url: &str, prefix: impl Into<String>, settings: RateLimitSettings) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let prefix = prefix.into();
        info!(max = settings.max, window_ms = settings.window_ms, "Rate limiter using Redis");
        Ok(Self {
            settings,
            counters: Counters::Redis {
                conn,
                prefix,
                script: Script::new(HIT_SCRIPT),
            },
        })
    }

    /// Keep counters in this process only.
    pub fn in_memory(settings: RateLimitSettings) -> Self {
        debug!(max = settings.max, window_ms = settings.window_ms, "Rate limiter using in-memory counters");
        Self {
            settings,
            counters: Counters::Local(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    fn backend(&self) -> &'static str {
        match self.counters {
            Counters::Redis { .. } => "redis",
            Counters::Local(_) => "memory",
        }
    }

    /// Count one request from `client`.
    pub async fn check(&self, client: &str) -> Result<RateLimitDecision> {
        let decision = match &self.counters {
            Counters::Redis { conn, prefix, script } => {
                let mut conn = conn.clone();
                let (count, ttl_ms): (u64, i64) = script
                    .key(format!("{}:rate-limit:{}", prefix, client))
                    .arg(self.settings.window_ms)
                    .invoke_async(&mut conn)
                    .await?;
                let reset_after = Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0));
                RateLimitDecision::from_count(self.settings.max, count, reset_after)
            }
            Counters::Local(windows) => self.check_local(windows, client),
        };

        counter!(
            "perch_rate_limit_checks_total",
            "backend" => self.backend(),
            "allowed" => decision.allowed.to_string(),
        )
        .increment(1);
        Ok(decision)
    }

    fn check_local(&self, windows: &DashMap<String, LocalWindow>, client: &str) -> RateLimitDecision {
        let window = self.settings.window();
        let now = Instant::now();

        if windows.len() > LOCAL_SWEEP_THRESHOLD {
            windows.retain(|_, w| now.duration_since(w.started) < window);
        }

        let mut entry = windows.entry(client.to_string()).or_insert(LocalWindow {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= window {
            *entry = LocalWindow {
                started: now,
                count: 0,
            };
        }
        entry.count += 1;

        let reset_after = window.saturating_sub(now.duration_since(entry.started));
        RateLimitDecision::from_count(self.settings.max, entry.count, reset_after)
    }
}

/// Counter key for a request: the peer address when known.
fn client_key(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn is_exempt(path: &str) -> bool {
    path == EXEMPT_PREFIX || path.starts_with("/health/")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Rate limiting layer for Tower.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if !limiter.settings.enabled || is_exempt(request.uri().path()) {
                return inner.call(request).await;
            }

            let client = client_key(&request);
            match limiter.check(&client).await {
                Ok(decision) if decision.allowed => {
                    let mut response = inner.call(request).await?;
                    decision.apply_headers(response.headers_mut());
                    Ok(response)
                }
                Ok(decision) => {
                    counter!("perch_rate_limit_rejected_total").increment(1);
                    debug!(client = %client, limit = decision.limit, "Rate limit exceeded");

                    let retry_after = decision.reset_secs();
                    let mut response = PerchError::rate_limited(retry_after).into_response();
                    let headers = response.headers_mut();
                    decision.apply_headers(headers);
                    headers.insert("Retry-After", HeaderValue::from(retry_after));
                    Ok(response)
                }
                Err(e) => {
                    // Counter store down: serve the request unlimited.
                    warn!(error = %e, "Rate limit check failed; skipping limit");
                    inner.call(request).await
                }
            }
        })
    }
}
