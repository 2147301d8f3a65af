//! Queue-depth autoscaling signal.
//!
//! An external orchestrator polls `/autoscale` and adjusts replicas. The
//! decision here is a pure function of queue state; smoothing or
//! hysteresis is the poller's job.

use serde::Serialize;

pub const DEFAULT_MIN_REPLICAS: u32 = 1;
pub const DEFAULT_MAX_REPLICAS: u32 = 8;
pub const DEFAULT_TARGET_PER_REPLICA: u32 = 5;

/// Autoscaler bounds, usually read from the environment.
#[derive(Debug, Clone, Copy)]
pub struct AutoscalerConfig {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_per_replica: u32,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            min_replicas: DEFAULT_MIN_REPLICAS,
            max_replicas: DEFAULT_MAX_REPLICAS,
            target_per_replica: DEFAULT_TARGET_PER_REPLICA,
        }
    }
}

/// The `/autoscale` response body.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScalingDecision {
    pub desired_replicas: u32,
    pub queue_depth: usize,
    pub processing_count: usize,
    pub total_load: usize,
    pub target_per_replica: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub reason: String,
}

/// Compute the desired replica count:
/// `clamp(ceil(load / target), min, max)`, with an idle floor of `min`.
pub fn decide(config: &AutoscalerConfig, pending: usize, in_flight: usize) -> ScalingDecision {
    let total_load = pending + in_flight;
    let target = config.target_per_replica.max(1);
    let desired = if total_load == 0 {
        config.min_replicas
    } else {
        (total_load as u32).div_ceil(target)
    };
    let desired = desired.clamp(config.min_replicas, config.max_replicas);

    let reason = if total_load == 0 {
        "idle".to_string()
    } else if desired == config.max_replicas {
        format!("at_max — load={total_load}")
    } else if desired > 1 {
        format!("scaling_up — load={total_load}, {target}/replica")
    } else {
        format!("nominal — load={total_load}")
    };

    ScalingDecision {
        desired_replicas: desired,
        queue_depth: pending,
        processing_count: in_flight,
        total_load,
        target_per_replica: target,
        min_replicas: config.min_replicas,
        max_replicas: config.max_replicas,
        reason,
    }
}
