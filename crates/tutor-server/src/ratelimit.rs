//! Per-IP sliding-window rate limiting.
//!
//! The window is approximated with two fixed buckets: the count of the
//! current bucket plus the count of the previous bucket weighted by how much
//! of it still overlaps the sliding window. A request is admitted while that
//! sum stays below the limit.
//!
//! Counters live either in this process ([`MemoryLimiter`]) or in Upstash
//! Redis, where the same arithmetic runs atomically as a Lua script sent over
//! the REST API ([`UpstashLimiter`]).

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderName,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::config::{RateLimitBackend, RateLimitConfig};
use crate::error::{Result, ServerError};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub success: bool,
    /// Requests admitted per window.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Unix time in milliseconds at which the current bucket ends.
    pub reset: u64,
}

/// Previous-bucket count scaled by its overlap with the sliding window.
fn weighted_previous(previous: u64, now_ms: u64, window_ms: u64) -> u64 {
    let left = window_ms - now_ms % window_ms;
    let weighted = u128::from(previous) * u128::from(left) / u128::from(window_ms);
    u64::try_from(weighted).unwrap_or(u64::MAX)
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

// ============================================================================
// In-process backend
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Bucket {
    index: u64,
    current: u64,
    previous: u64,
}

impl Bucket {
    /// Moves the bucket forward to window `index`.
    fn roll(&mut self, index: u64) {
        if self.index == index {
            return;
        }
        self.previous = if self.index + 1 == index {
            self.current
        } else {
            0
        };
        self.current = 0;
        self.index = index;
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    buckets: HashMap<String, Bucket>,
    /// Window index of the last sweep over `buckets`.
    last_pruned: u64,
}

impl MemoryState {
    /// Drops buckets that can no longer count towards window `index`.
    ///
    /// Runs at most once per window.
    fn prune(&mut self, index: u64) {
        if index <= self.last_pruned {
            return;
        }
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.index + 1 >= index);
        self.last_pruned = index;

        let dropped = before - self.buckets.len();
        if dropped > 0 {
            debug!(dropped, kept = self.buckets.len(), "Pruned stale rate-limit buckets");
        }
    }
}

/// Sliding-window limiter that keeps its counters in memory.
///
/// Keys idle for two windows are dropped on the first request of a new
/// window.
#[derive(Debug)]
pub struct MemoryLimiter {
    limit: u32,
    window_ms: u64,
    state: Mutex<MemoryState>,
}

impl MemoryLimiter {
    /// Creates a limiter admitting `limit` requests per `window_ms`.
    #[must_use]
    pub fn new(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms: window_ms.max(1),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Checks and records a request for `key` at `now_ms`.
    pub async fn check_at(&self, key: &str, now_ms: u64) -> RateLimitDecision {
        let index = now_ms / self.window_ms;
        let reset = (index + 1) * self.window_ms;
        let limit = u64::from(self.limit);

        let mut state = self.state.lock().await;
        state.prune(index);

        let bucket = state.buckets.entry(key.to_string()).or_insert(Bucket {
            index,
            current: 0,
            previous: 0,
        });
        bucket.roll(index);

        let weighted = weighted_previous(bucket.previous, now_ms, self.window_ms);
        if weighted + bucket.current >= limit {
            return RateLimitDecision {
                success: false,
                limit: self.limit,
                remaining: 0,
                reset,
            };
        }

        bucket.current += 1;
        RateLimitDecision {
            success: true,
            limit: self.limit,
            remaining: clamp_u32(limit.saturating_sub(weighted + bucket.current)),
            reset,
        }
    }

    #[cfg(test)]
    async fn tracked_keys(&self) -> usize {
        self.state.lock().await.buckets.len()
    }
}

// ============================================================================
// Upstash backend
// ============================================================================

/// Runs the sliding-window check and increment atomically inside Redis.
///
/// `KEYS[1]` current bucket, `KEYS[2]` previous bucket; `ARGV` = limit,
/// now (ms), window (ms), increment. Returns -1 when the request is
/// rejected, otherwise the remaining allowance.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local current = tonumber(redis.call("GET", KEYS[1]) or "0")
local previous = tonumber(redis.call("GET", KEYS[2]) or "0")
local limit = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local weighted = math.floor(previous * (window - now % window) / window)
if weighted + current >= limit then
  return -1
end
local updated = redis.call("INCRBY", KEYS[1], ARGV[4])
if updated == tonumber(ARGV[4]) then
  redis.call("PEXPIRE", KEYS[1], window * 2 + 1000)
end
return limit - (updated + weighted)
"#;

/// Response envelope of the Upstash REST API.
#[derive(Debug, Deserialize)]
struct UpstashReply {
    #[serde(default)]
    result: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

/// Sliding-window limiter backed by Upstash Redis.
#[derive(Clone)]
pub struct UpstashLimiter {
    http: reqwest::Client,
    url: String,
    token: String,
    prefix: String,
    limit: u32,
    window_ms: u64,
}

impl std::fmt::Debug for UpstashLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstashLimiter")
            .field("url", &self.url)
            .field("prefix", &self.prefix)
            .field("limit", &self.limit)
            .field("window_ms", &self.window_ms)
            .finish_non_exhaustive()
    }
}

impl UpstashLimiter {
    /// Creates a limiter talking to the Upstash REST endpoint at `url`.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        token: impl Into<String>,
        prefix: impl Into<String>,
        limit: u32,
        window_ms: u64,
    ) -> Self {
        Self {
            http,
            url: url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            prefix: prefix.into(),
            limit,
            window_ms: window_ms.max(1),
        }
    }

    fn bucket_key(&self, key: &str, index: u64) -> String {
        format!("{}:{key}:{index}", self.prefix)
    }

    /// Checks and records a request for `key` at `now_ms`.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::RateLimiterUnavailable` when Upstash cannot be
    /// reached or answers with an error.
    pub async fn check_at(&self, key: &str, now_ms: u64) -> Result<RateLimitDecision> {
        let index = now_ms / self.window_ms;
        let reset = (index + 1) * self.window_ms;

        let command = serde_json::json!([
            "EVAL",
            SLIDING_WINDOW_SCRIPT,
            "2",
            self.bucket_key(key, index),
            self.bucket_key(key, index.saturating_sub(1)),
            self.limit.to_string(),
            now_ms.to_string(),
            self.window_ms.to_string(),
            "1",
        ]);

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&command)
            .send()
            .await
            .map_err(|e| ServerError::rate_limiter(format!("request failed: {e}")))?;

        let status = response.status();
        let reply: UpstashReply = response
            .json()
            .await
            .map_err(|e| ServerError::rate_limiter(format!("invalid reply ({status}): {e}")))?;

        if let Some(error) = reply.error {
            return Err(ServerError::rate_limiter(error));
        }
        let Some(result) = reply.result else {
            return Err(ServerError::rate_limiter(format!(
                "reply without result ({status})"
            )));
        };

        Ok(if result < 0 {
            RateLimitDecision {
                success: false,
                limit: self.limit,
                remaining: 0,
                reset,
            }
        } else {
            RateLimitDecision {
                success: true,
                limit: self.limit,
                remaining: clamp_u32(u64::try_from(result).unwrap_or(0)),
                reset,
            }
        })
    }
}

// ============================================================================
// Backend selection and middleware
// ============================================================================

/// A configured rate-limit backend.
#[derive(Debug)]
pub enum RateLimiter {
    /// In-process counters.
    Memory(MemoryLimiter),
    /// Upstash Redis counters.
    Upstash(UpstashLimiter),
}

impl RateLimiter {
    /// Builds the backend selected in `config`, or `None` when limiting is disabled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::MissingSecret` if the Upstash backend is selected
    /// without credentials.
    pub fn from_config(config: &RateLimitConfig, http: reqwest::Client) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }

        let limiter = match config.backend {
            RateLimitBackend::Memory => {
                Self::Memory(MemoryLimiter::new(config.limit, config.window_ms()))
            }
            RateLimitBackend::Upstash => {
                let url = config
                    .upstash_url
                    .clone()
                    .ok_or_else(|| ServerError::missing_secret(crate::config::ENV_UPSTASH_URL))?;
                let token = config
                    .upstash_token
                    .clone()
                    .ok_or_else(|| ServerError::missing_secret(crate::config::ENV_UPSTASH_TOKEN))?;
                Self::Upstash(UpstashLimiter::new(
                    http,
                    url,
                    token,
                    config.prefix.clone(),
                    config.limit,
                    config.window_ms(),
                ))
            }
        };
        Ok(Some(limiter))
    }

    /// Checks and records a request for `key` now.
    pub async fn limit(&self, key: &str) -> Result<RateLimitDecision> {
        self.limit_at(key, now_ms()).await
    }

    /// Checks and records a request for `key` at `now_ms`.
    pub async fn limit_at(&self, key: &str, now_ms: u64) -> Result<RateLimitDecision> {
        match self {
            Self::Memory(limiter) => Ok(limiter.check_at(key, now_ms).await),
            Self::Upstash(limiter) => limiter.check_at(key, now_ms).await,
        }
    }
}

/// State of the rate-limit middleware.
#[derive(Debug)]
pub struct RateLimitGuard {
    limiter: RateLimiter,
    ip_header: HeaderName,
}

impl RateLimitGuard {
    /// Creates a guard keyed by the value of `ip_header`.
    #[must_use]
    pub const fn new(limiter: RateLimiter, ip_header: HeaderName) -> Self {
        Self { limiter, ip_header }
    }
}

/// Middleware rejecting requests that exceed the per-IP allowance.
///
/// Requests without the client IP header get 400, rejected requests get
/// 429 with `X-RateLimit-*` headers, and store failures get 503.
pub async fn rate_limit_middleware(
    State(guard): State<Arc<RateLimitGuard>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = request
        .headers()
        .get(&guard.ip_header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(ToString::to_string);

    let Some(ip) = ip else {
        warn!(header = %guard.ip_header, "Request without client IP header");
        return ApiError::MissingClientIp.into_response();
    };

    match guard.limiter.limit(&ip).await {
        Ok(decision) if decision.success => {
            debug!(%ip, remaining = decision.remaining, "Request admitted");
            next.run(request).await
        }
        Ok(decision) => {
            warn!(%ip, limit = decision.limit, "Rate limit exceeded");
            ApiError::RateLimited(decision).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Rate limiter unavailable");
            ApiError::RateLimiterUnavailable.into_response()
        }
    }
}
