//! Per-user admission rate limiting.
//!
//! Both backends run the same sliding-window algorithm over a set of
//! request timestamps: trim entries older than the window, count what is
//! left, deny at the quota or record the new request. The distributed
//! backend keeps the window in a redis sorted set so every replica sees
//! the same count; the in-process fallback holds it under a mutex with a
//! lower default quota because its state dies with the process.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

mod fallback;
mod redis;

pub use fallback::FallbackLimiter;
pub use redis::RedisRateLimiter;

/// Default quota on the distributed backend.
pub const DEFAULT_MAX_REQUESTS: u32 = 5;
/// Default quota when only the in-process fallback is available.
pub const FALLBACK_MAX_REQUESTS: u32 = 3;
/// Default sliding window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// The outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// Request admitted. `remaining` is how many more fit in this window,
    /// useful for `X-RateLimit-Remaining` headers.
    Allowed { remaining: u32 },
    /// Request denied. `retry_after` maps onto the `Retry-After` header.
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    pub fn retry_after_secs(&self) -> u64 {
        match self {
            RateDecision::Allowed { .. } => 0,
            RateDecision::Denied { retry_after } => retry_after.as_secs(),
        }
    }
}

/// A sliding-window rate limiter keyed by principal.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check and, if allowed, record a request for `principal`.
    async fn check(
        &self,
        principal: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateDecision, StoreError>;
}

/// Seconds until the oldest recorded request leaves the window. The `+ 1`
/// rounds up so a caller sleeping exactly `retry_after` lands inside the
/// next window.
pub(crate) fn retry_after_from_oldest(oldest: f64, window: Duration, now: f64) -> Duration {
    let secs = (oldest + window.as_secs_f64() - now).max(0.0) as u64 + 1;
    Duration::from_secs(secs)
}
