//! Retry delay strategies for provider calls.

use rand::Rng;
use std::time::Duration;

/// Upper bound on any computed delay. Providers that ask for more via
/// `Retry-After` are still capped here.
pub const MAX_DELAY: Duration = Duration::from_secs(120);

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries.
    Constant { delay: Duration },
    /// `base * 2^attempt`, capped at `MAX_DELAY`.
    Exponential { base: Duration },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base }
    }

    /// Delay for a given attempt number (0-indexed: the delay applied
    /// after the first failure is `delay(0)`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base } => {
                let multiplier = 2u32.saturating_pow(attempt);
                base.checked_mul(multiplier).unwrap_or(MAX_DELAY)
            }
        };
        raw.min(MAX_DELAY)
    }
}

/// Additive jitter to spread concurrent retriers apart.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// No jitter — use the exact backoff delay.
    None,
    /// Add a uniform random duration in `[0, max]`.
    Uniform { max: Duration },
}

impl Jitter {
    pub fn uniform(max: Duration) -> Self {
        Jitter::Uniform { max }
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-provided RNG (deterministic in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Uniform { max } => {
                let max_millis = max.as_millis() as u64;
                if max_millis == 0 {
                    return delay;
                }
                delay + Duration::from_millis(rng.random_range(0..=max_millis))
            }
        }
    }
}
