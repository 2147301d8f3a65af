//! Thread-safe in-memory metrics: counters, gauges, latency samples,
//! per-minute time-series, and a bounded ring of recent errors.
//!
//! Everything lives behind one mutex and resets on restart. Recording is
//! deliberately infallible — a metrics problem must never take down a job —
//! so a poisoned lock is re-entered rather than propagated.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::time::Clock;

/// Latency samples retained per endpoint.
const MAX_SAMPLES: usize = 100;
/// Minutes of per-minute buckets retained per series.
const MAX_MINUTES: i64 = 60;
/// Recent errors retained for root-cause inspection.
const MAX_ERRORS: usize = 50;
/// Error messages stored in the ring are bounded.
const MAX_ERROR_MESSAGE: usize = 300;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorEvent {
    pub timestamp: f64,
    pub endpoint: String,
    pub error_type: String,
    pub message: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub avg: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesPoint {
    pub t: i64,
    pub v: u64,
}

/// Consistent view of everything the registry has collected.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: f64,
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub latency: HashMap<String, LatencyStats>,
    pub timeseries: HashMap<String, Vec<SeriesPoint>>,
    pub error_rate_5m: f64,
    pub recent_errors: Vec<ErrorEvent>,
    pub error_patterns: HashMap<String, u64>,
    pub uptime_seconds: f64,
}

#[derive(Debug, Default)]
struct Inner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    latency: HashMap<String, VecDeque<f64>>,
    // name -> minute bucket (epoch secs floored to the minute) -> count
    series: HashMap<String, HashMap<i64, u64>>,
    errors: VecDeque<ErrorEvent>,
}

/// Registry of service metrics. Cheap to clone and share.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
    started_at: f64,
}

fn minute_bucket(now: f64) -> i64 {
    (now as i64) / 60 * 60
}

/// Only request/error traffic is bucketed into time-series; other counters
/// stay as plain monotone totals.
fn tracked_series(name: &str) -> bool {
    name.starts_with("requests.") || name.starts_with("errors.")
}

impl MetricsRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self { inner: Arc::new(Mutex::new(Inner::default())), clock, started_at }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Increment a counter, e.g. `requests.generate` or `errors.gateway_429`.
    pub fn inc_counter(&self, name: &str) {
        self.inc_counter_by(name, 1);
    }

    pub fn inc_counter_by(&self, name: &str, amount: u64) {
        let now = self.clock.now();
        let mut inner = self.lock();
        *inner.counters.entry(name.to_string()).or_default() += amount;
        if tracked_series(name) {
            let buckets = inner.series.entry(name.to_string()).or_default();
            *buckets.entry(minute_bucket(now)).or_default() += amount;
            // Drop buckets that fell out of the retention window.
            let cutoff = minute_bucket(now) - MAX_MINUTES * 60;
            buckets.retain(|&t, _| t >= cutoff);
        }
    }

    /// Record one latency sample in milliseconds for an endpoint.
    pub fn record_latency(&self, endpoint: &str, duration_ms: f64) {
        let mut inner = self.lock();
        let samples = inner.latency.entry(endpoint.to_string()).or_default();
        samples.push_back(duration_ms);
        while samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.lock().gauges.insert(name.to_string(), value);
    }

    /// Append to the error ring. The message is truncated; the ring is
    /// bounded.
    pub fn record_error(&self, endpoint: &str, error_type: &str, message: &str, user_id: &str) {
        let event = ErrorEvent {
            timestamp: self.clock.now(),
            endpoint: endpoint.to_string(),
            error_type: error_type.to_string(),
            message: crate::error::truncate_message(message, MAX_ERROR_MESSAGE),
            user_id: user_id.to_string(),
        };
        let mut inner = self.lock();
        inner.errors.push_back(event);
        while inner.errors.len() > MAX_ERRORS {
            inner.errors.pop_front();
        }
    }

    /// Take a consistent snapshot of everything collected so far.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = self.clock.now();
        let minute_now = minute_bucket(now);
        let inner = self.lock();

        let mut latency = HashMap::new();
        for (endpoint, samples) in &inner.latency {
            if samples.is_empty() {
                continue;
            }
            let mut sorted: Vec<f64> = samples.iter().copied().collect();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let n = sorted.len();
            let last = sorted[n - 1];
            latency.insert(
                endpoint.clone(),
                LatencyStats {
                    p50: sorted[n / 2],
                    p95: if n >= 20 { sorted[(n as f64 * 0.95) as usize] } else { last },
                    p99: if n >= 100 { sorted[(n as f64 * 0.99) as usize] } else { last },
                    avg: sorted.iter().sum::<f64>() / n as f64,
                    count: n,
                },
            );
        }

        let mut timeseries = HashMap::new();
        for (name, buckets) in &inner.series {
            let mut points = Vec::with_capacity(MAX_MINUTES as usize);
            for i in 0..MAX_MINUTES {
                let t = minute_now - (MAX_MINUTES - 1 - i) * 60;
                points.push(SeriesPoint { t, v: buckets.get(&t).copied().unwrap_or(0) });
            }
            timeseries.insert(name.clone(), points);
        }

        // Error rate over the last five minutes of tracked traffic.
        let recent_cutoff = minute_now - 5 * 60;
        let mut recent_requests = 0u64;
        let mut recent_errors = 0u64;
        for (name, buckets) in &inner.series {
            let sum: u64 = buckets.iter().filter(|(&t, _)| t >= recent_cutoff).map(|(_, &v)| v).sum();
            if name.starts_with("requests.") {
                recent_requests += sum;
            } else if name.starts_with("errors.") {
                recent_errors += sum;
            }
        }
        let error_rate_5m = if recent_requests > 0 {
            (recent_errors as f64 / recent_requests as f64 * 100.0 * 100.0).round() / 100.0
        } else {
            0.0
        };

        let mut error_patterns: HashMap<String, u64> = HashMap::new();
        for event in &inner.errors {
            *error_patterns
                .entry(format!("{}:{}", event.endpoint, event.error_type))
                .or_default() += 1;
        }

        MetricsSnapshot {
            timestamp: now,
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            latency,
            timeseries,
            error_rate_5m,
            recent_errors: inner.errors.iter().rev().take(10).rev().cloned().collect(),
            error_patterns,
            uptime_seconds: now - self.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn registry_at(start: f64) -> (MetricsRegistry, ManualClock) {
        let clock = ManualClock::new(start);
        (MetricsRegistry::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn counters_accumulate() {
        let (metrics, _) = registry_at(60_000.0);
        metrics.inc_counter("requests.generate");
        metrics.inc_counter("requests.generate");
        metrics.inc_counter_by("jobs.enqueued", 3);
        let snap = metrics.snapshot();
        assert_eq!(snap.counters["requests.generate"], 2);
        assert_eq!(snap.counters["jobs.enqueued"], 3);
    }

    #[test]
    fn latency_ring_is_bounded_and_percentiles_computed() {
        let (metrics, _) = registry_at(60_000.0);
        for i in 0..150 {
            metrics.record_latency("generate", i as f64);
        }
        let snap = metrics.snapshot();
        let stats = &snap.latency["generate"];
        assert_eq!(stats.count, 100);
        // Ring keeps the last 100 samples: 50..150.
        assert_eq!(stats.p50, 100.0);
        assert!(stats.p95 >= 140.0);
        assert!(stats.avg > 99.0 && stats.avg < 100.0);
    }

    #[test]
    fn small_sample_sets_fall_back_to_max() {
        let (metrics, _) = registry_at(60_000.0);
        for v in [10.0, 20.0, 30.0] {
            metrics.record_latency("tryon", v);
        }
        let stats = &metrics.snapshot().latency["tryon"];
        assert_eq!(stats.p95, 30.0);
        assert_eq!(stats.p99, 30.0);
    }

    #[test]
    fn series_tracked_only_for_request_and_error_counters() {
        let (metrics, _) = registry_at(60_000.0);
        metrics.inc_counter("requests.generate");
        metrics.inc_counter("errors.gateway");
        metrics.inc_counter("jobs.enqueued");
        let snap = metrics.snapshot();
        assert!(snap.timeseries.contains_key("requests.generate"));
        assert!(snap.timeseries.contains_key("errors.gateway"));
        assert!(!snap.timeseries.contains_key("jobs.enqueued"));
        assert_eq!(snap.timeseries["requests.generate"].len(), 60);
    }

    #[test]
    fn bucket_sum_never_exceeds_counter_total() {
        let (metrics, clock) = registry_at(60_000.0);
        for _ in 0..5 {
            metrics.inc_counter("requests.generate");
            clock.advance(61.0);
        }
        let snap = metrics.snapshot();
        let bucket_sum: u64 = snap.timeseries["requests.generate"].iter().map(|p| p.v).sum();
        assert!(bucket_sum <= snap.counters["requests.generate"]);
    }

    #[test]
    fn stale_buckets_are_pruned_on_write() {
        let (metrics, clock) = registry_at(60_000.0);
        metrics.inc_counter("requests.generate");
        clock.advance((MAX_MINUTES as f64 + 5.0) * 60.0);
        metrics.inc_counter("requests.generate");
        let snap = metrics.snapshot();
        let visible: u64 = snap.timeseries["requests.generate"].iter().map(|p| p.v).sum();
        // The first increment aged out of the 60-minute window.
        assert_eq!(visible, 1);
        assert_eq!(snap.counters["requests.generate"], 2);
    }

    #[test]
    fn error_ring_keeps_most_recent_and_patterns() {
        let (metrics, _) = registry_at(60_000.0);
        for i in 0..60 {
            metrics.record_error("generate", "gateway", &format!("boom {i}"), "u1");
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.recent_errors.len(), 10);
        assert_eq!(snap.recent_errors.last().map(|e| e.message.as_str()), Some("boom 59"));
        assert_eq!(snap.error_patterns["generate:gateway"], 50);
    }

    #[test]
    fn error_rate_over_five_minutes() {
        let (metrics, _) = registry_at(60_000.0);
        for _ in 0..8 {
            metrics.inc_counter("requests.generate");
        }
        metrics.inc_counter("errors.gateway");
        metrics.inc_counter("errors.gateway");
        let snap = metrics.snapshot();
        assert_eq!(snap.error_rate_5m, 25.0);
    }

    #[test]
    fn uptime_tracks_the_clock() {
        let (metrics, clock) = registry_at(60_000.0);
        clock.advance(42.0);
        assert_eq!(metrics.snapshot().uptime_seconds, 42.0);
    }

    #[test]
    fn gauges_overwrite() {
        let (metrics, _) = registry_at(60_000.0);
        metrics.set_gauge("queue_depth", 3.0);
        metrics.set_gauge("queue_depth", 7.0);
        assert_eq!(metrics.snapshot().gauges["queue_depth"], 7.0);
    }
}
