//! Time seams: wall-clock reads and sleeping behind traits.
//!
//! Queue metadata, rate windows, and poll deadlines all work in absolute
//! epoch seconds, so the clock here is wall-clock rather than monotonic.
//! Both traits exist so time-dependent tests run instantly.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock abstraction. Returns epoch seconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> f64;
}

/// Production clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn advance(&self, secs: f64) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += secs;
    }

    pub fn set(&self, at: f64) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Abstraction for sleeping between retries and poll cycles.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper using the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Test sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Test sleeper that records every requested duration.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Sum of all recorded sleeps.
    pub fn total(&self) -> Duration {
        self.calls().iter().sum()
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
    }
}
