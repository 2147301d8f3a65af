//! In-process sliding-window limiter for redis-less operation.
//!
//! State is volatile, so this path is deliberately more restrictive than
//! the distributed one (see [`FALLBACK_MAX_REQUESTS`]): a restart forgets
//! every window, and a conservative quota bounds the worst-case burst a
//! user can get by racing restarts.
//!
//! [`FALLBACK_MAX_REQUESTS`]: super::FALLBACK_MAX_REQUESTS

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{retry_after_from_oldest, RateDecision, RateLimiter};
use crate::error::StoreError;
use crate::time::Clock;

/// Mutex-guarded map of principal → recent request timestamps.
#[derive(Debug, Clone)]
pub struct FallbackLimiter {
    requests: Arc<Mutex<HashMap<String, Vec<f64>>>>,
    clock: Arc<dyn Clock>,
}

impl FallbackLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { requests: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<f64>>> {
        self.requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop principals whose every entry has aged out. Call periodically;
    /// the per-check trim only touches principals that keep requesting.
    pub fn cleanup_expired(&self, window: Duration) {
        let cutoff = self.clock.now() - window.as_secs_f64();
        let mut requests = self.lock();
        requests.retain(|_, timestamps| {
            timestamps.retain(|&ts| ts > cutoff);
            !timestamps.is_empty()
        });
    }

    /// Number of principals currently tracked.
    pub fn tracked_principals(&self) -> usize {
        self.lock().len()
    }
}

#[async_trait]
impl RateLimiter for FallbackLimiter {
    async fn check(
        &self,
        principal: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<RateDecision, StoreError> {
        let now = self.clock.now();
        let window_start = now - window.as_secs_f64();

        let mut requests = self.lock();
        let timestamps = requests.entry(principal.to_string()).or_default();
        // Strict `>`: a request exactly at the boundary belongs to the new
        // window.
        timestamps.retain(|&ts| ts > window_start);

        if timestamps.len() >= max_requests as usize {
            let oldest = timestamps.first().copied().unwrap_or(now);
            return Ok(RateDecision::Denied {
                retry_after: retry_after_from_oldest(oldest, window, now),
            });
        }

        timestamps.push(now);
        let remaining = max_requests - timestamps.len() as u32;
        Ok(RateDecision::Allowed { remaining })
    }
}
