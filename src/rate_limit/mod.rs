// Per-client rate limiting for the auth and resource surfaces.
//
// Token bucket per client key, refilled continuously at `limit / window`.
// State is in-memory only (resets on restart).

use crate::api::error::ApiError;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Token bucket for a single client.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token. On refusal returns the wait until one is available.
    fn try_consume(&mut self, capacity: u64, refill_per_sec: f64) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / refill_per_sec))
        }
    }
}

/// Per-client token bucket rate limiter.
///
/// Buckets are created lazily on a client's first request.
pub struct RateLimiter {
    name: &'static str,
    limit: u64,
    window: Duration,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    /// Allow `limit` requests per `window` per client, with bursts up to `limit`
    pub fn new(name: &'static str, limit: u64, window: Duration) -> Self {
        Self {
            name,
            limit: limit.max(1),
            window: window.max(Duration::from_secs(1)),
            buckets: DashMap::new(),
        }
    }

    /// Check and consume one token for `key`.
    ///
    /// Returns `Err(retry_after_secs)` if the limit is exceeded.
    pub fn check_and_consume(&self, key: &str) -> Result<(), u64> {
        let refill_per_sec = self.limit as f64 / self.window.as_secs_f64();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.limit));
        bucket
            .try_consume(self.limit, refill_per_sec)
            .map_err(|wait| wait.as_secs_f64().ceil().max(1.0) as u64)
    }
}

/// Client key: first `X-Forwarded-For` hop, or `unknown`.
pub fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// axum middleware; attach with `middleware::from_fn_with_state(limiter, enforce)`.
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(request.headers());
    match limiter.check_and_consume(&key) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::warn!(
                limiter = limiter.name,
                client = %key,
                retry_after,
                "Rate limit exceeded"
            );
            ApiError::RateLimited { retry_after }.into_response()
        }
    }
}
