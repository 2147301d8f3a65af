//! Redis-backed sliding window over sorted sets.
//!
//! Each principal gets a sorted set at `ratelimit:{principal}`; members
//! are request markers scored by their timestamp. A check is two
//! transactions: trim-and-count, then (only on allow) record-and-expire.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{retry_after_from_oldest, RateDecision, RateLimiter};
use crate::error::StoreError;
use crate::time::Clock;

const KEY_PREFIX: &str = "ratelimit:";
/// Keys outlive the window slightly so a denied caller can still be
/// answered from the same set.
const TTL_SLACK: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct RedisRateLimiter {
    manager: redis::aio::ConnectionManager,
    clock: Arc<dyn Clock>,
}

impl RedisRateLimiter {
    pub fn new(manager: redis::aio::ConnectionManager, clock: Arc<dyn Clock>) -> Self {
        Self { manager, clock }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(
        &self,
        principal: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateDecision, StoreError> {
        let key = format!("{KEY_PREFIX}{principal}");
        let now = self.clock.now();
        let window_start = now - window.as_secs_f64();
        let mut conn = self.manager.clone();

        // Trim entries at or below the boundary (strict `>` survives),
        // count the remainder, and grab the oldest for Retry-After.
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("ZREMRANGEBYSCORE").arg(&key).arg(0).arg(window_start).ignore();
        pipe.cmd("ZCARD").arg(&key);
        pipe.cmd("ZRANGE").arg(&key).arg(0).arg(0).arg("WITHSCORES");
        let (count, oldest): (u32, Vec<(String, f64)>) = pipe.query_async(&mut conn).await?;

        if count >= max_requests {
            let oldest_score = oldest.first().map(|(_, score)| *score).unwrap_or(now);
            let retry_after = retry_after_from_oldest(oldest_score, window, now);
            tracing::warn!(principal, count, max_requests, "rate limit exceeded");
            return Ok(RateDecision::Denied { retry_after });
        }

        // Members carry a uuid suffix so two requests in the same instant
        // both count.
        let member = format!("{now}-{}", uuid::Uuid::new_v4());
        let ttl = (window + TTL_SLACK).as_secs() as i64;
        let mut record = redis::pipe();
        record.atomic();
        record.cmd("ZADD").arg(&key).arg(now).arg(member).ignore();
        record.cmd("EXPIRE").arg(&key).arg(ttl).ignore();
        record.query_async::<()>(&mut conn).await?;

        Ok(RateDecision::Allowed { remaining: max_requests - count - 1 })
    }
}
