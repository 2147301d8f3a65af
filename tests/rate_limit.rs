//! Rate limiter properties through the public surface: remaining
//! monotonicity, the sliding-window admission bound, boundary retry-after
//! arithmetic, window expiry, and degradation from a failing distributed
//! backend to the in-process limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atelier::admission::AdmissionService;
use atelier::config::Config;
use atelier::error::StoreError;
use atelier::guard::JobSlots;
use atelier::jobstore::MemoryJobStore;
use atelier::metrics::MetricsRegistry;
use atelier::pipeline::PipelineOrchestrator;
use atelier::providers::ProviderCatalog;
use atelier::queue::TaskQueue;
use atelier::rate_limit::{FallbackLimiter, RateDecision, RateLimiter};
use atelier::store::MemoryBackend;
use atelier::time::{InstantSleeper, ManualClock};

fn limiter_at(start: f64) -> (FallbackLimiter, ManualClock) {
    let clock = ManualClock::new(start);
    (FallbackLimiter::new(Arc::new(clock.clone())), clock)
}

#[tokio::test]
async fn hourly_quota_runs_down_then_denies_then_recovers() {
    let (limiter, clock) = limiter_at(1_000.0);
    let window = Duration::from_secs(3600);

    // Five requests in one second run the remaining count down 4..0.
    let mut remaining_seen = Vec::new();
    for _ in 0..5 {
        match limiter.check("u1", 5, window).await.unwrap() {
            RateDecision::Allowed { remaining } => remaining_seen.push(remaining),
            RateDecision::Denied { .. } => panic!("should be within quota"),
        }
    }
    assert_eq!(remaining_seen, vec![4, 3, 2, 1, 0]);

    // The sixth is denied for roughly the full window.
    let sixth = limiter.check("u1", 5, window).await.unwrap();
    assert!(!sixth.is_allowed());
    assert!(sixth.retry_after_secs() >= 3600);

    // An hour later the seventh goes through.
    clock.advance(3601.0);
    assert!(limiter.check("u1", 5, window).await.unwrap().is_allowed());
}

#[tokio::test]
async fn remaining_never_increases_within_a_window() {
    let (limiter, clock) = limiter_at(1_000.0);
    let window = Duration::from_secs(600);

    let mut previous = u32::MAX;
    // Spread the calls inside one window; each admitted call must report
    // a strictly smaller remaining than the one before it.
    for _ in 0..6 {
        if let RateDecision::Allowed { remaining } =
            limiter.check("u1", 6, window).await.unwrap()
        {
            assert!(remaining < previous);
            previous = remaining;
        }
        clock.advance(30.0);
    }
}

#[tokio::test]
async fn no_sliding_window_ever_admits_more_than_max() {
    let (limiter, clock) = limiter_at(0.0);
    let window = Duration::from_secs(60);
    let max = 3u32;

    // Hammer the limiter every 10 seconds for five minutes, recording
    // when each admitted request happened.
    let mut admitted: Vec<f64> = Vec::new();
    for tick in 0..30 {
        let now = tick as f64 * 10.0;
        if limiter.check("u1", max, window).await.unwrap().is_allowed() {
            admitted.push(now);
        }
        clock.advance(10.0);
    }
    assert!(admitted.len() > max as usize, "expected admissions across several windows");

    // Every window of length 60 anchored at an admitted request holds at
    // most `max` admissions.
    for &anchor in &admitted {
        let in_window = admitted
            .iter()
            .filter(|&&at| at > anchor - 60.0 && at <= anchor)
            .count();
        assert!(in_window <= max as usize, "window ending at {anchor} admitted {in_window}");
    }
}

#[tokio::test]
async fn denial_reports_exact_retry_after_from_the_oldest_entry() {
    let (limiter, clock) = limiter_at(0.0);
    let window = Duration::from_secs(60);

    // Entries land at t = 0, 10, 20, 30; at count = max-1 the next call
    // is still admitted.
    for _ in 0..4 {
        assert!(limiter.check("u1", 5, window).await.unwrap().is_allowed());
        clock.advance(10.0);
    }
    // t = 40: fifth fills the quota.
    assert!(limiter.check("u1", 5, window).await.unwrap().is_allowed());

    // Still at t = 40: denied, and the wait is oldest + window - now + 1,
    // here 0 + 60 - 40 + 1.
    let denied = limiter.check("u1", 5, window).await.unwrap();
    assert_eq!(denied.retry_after_secs(), 21);
}

#[tokio::test]
async fn boundary_entries_count_toward_the_new_window() {
    let (limiter, clock) = limiter_at(500.0);
    let window = Duration::from_secs(60);

    assert!(limiter.check("u1", 1, window).await.unwrap().is_allowed());
    assert!(!limiter.check("u1", 1, window).await.unwrap().is_allowed());

    // Exactly one window later the old entry is trimmed, not counted.
    clock.advance(60.0);
    assert!(limiter.check("u1", 1, window).await.unwrap().is_allowed());
}

#[tokio::test]
async fn principals_do_not_share_windows() {
    let (limiter, _) = limiter_at(1_000.0);
    let window = Duration::from_secs(3600);

    for _ in 0..3 {
        assert!(limiter.check("alice", 3, window).await.unwrap().is_allowed());
    }
    assert!(!limiter.check("alice", 3, window).await.unwrap().is_allowed());
    assert!(limiter.check("bob", 3, window).await.unwrap().is_allowed());
}

#[tokio::test]
async fn cleanup_forgets_idle_principals_but_keeps_active_ones() {
    let (limiter, clock) = limiter_at(1_000.0);
    let window = Duration::from_secs(60);

    limiter.check("idle", 3, window).await.unwrap();
    clock.advance(45.0);
    limiter.check("active", 3, window).await.unwrap();
    assert_eq!(limiter.tracked_principals(), 2);

    clock.advance(20.0);
    limiter.cleanup_expired(window);
    assert_eq!(limiter.tracked_principals(), 1);
}

// ── Degradation from a failing distributed backend ───────────────────────

/// Stands in for a redis limiter whose backend has gone away.
#[derive(Debug)]
struct FailingLimiter;

#[async_trait]
impl RateLimiter for FailingLimiter {
    async fn check(
        &self,
        _principal: &str,
        _max_requests: u32,
        _window: Duration,
    ) -> Result<RateDecision, StoreError> {
        Err(StoreError::Backend("connection refused".to_string()))
    }
}

fn service_with_failing_primary(fallback_max: u32) -> AdmissionService {
    let clock: Arc<ManualClock> = Arc::new(ManualClock::new(1_000.0));
    let metrics = MetricsRegistry::new(clock.clone());
    let store = Arc::new(MemoryJobStore::new());
    let catalog = Arc::new(ProviderCatalog::new(
        &Config::from_lookup(|_| None).unwrap(),
        reqwest::Client::new(),
        clock.clone(),
        Arc::new(InstantSleeper),
    ));
    let orchestrator =
        Arc::new(PipelineOrchestrator::new(store.clone(), catalog, metrics.clone()));
    AdmissionService::new(
        Some(Arc::new(FailingLimiter)),
        Arc::new(FallbackLimiter::new(clock.clone())),
        Some(TaskQueue::new(Arc::new(MemoryBackend::new()), clock.clone())),
        JobSlots::new(3),
        orchestrator,
        store,
        metrics,
        clock,
        5,
        fallback_max,
        Duration::from_secs(3600),
    )
}

#[tokio::test]
async fn failing_distributed_backend_degrades_to_the_fallback_quota() {
    let service = service_with_failing_primary(2);

    // The distributed check errors on every call; requests still get an
    // answer, now bounded by the stricter in-process quota.
    assert!(service.check_rate("u1").await.is_allowed());
    assert!(service.check_rate("u1").await.is_allowed());
    let third = service.check_rate("u1").await;
    assert!(!third.is_allowed());
    assert!(third.retry_after_secs() >= 3600);
}
