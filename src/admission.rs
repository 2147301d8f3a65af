//! Admission control: rate check, then enqueue or run inline.
//!
//! With the distributed queue available, admitted jobs are enqueued and
//! the dispatcher picks them up. Without it, jobs run inline on the
//! handler pool, bounded by [`JobSlots`]; the slot is taken before the
//! task is spawned, and the permit held by the task releases it on
//! every exit path, panics included.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueueError;
use crate::guard::JobSlots;
use crate::jobstore::JobStore;
use crate::metrics::MetricsRegistry;
use crate::pipeline::PipelineOrchestrator;
use crate::queue::{JobMeta, JobStatus, TaskKind, TaskQueue};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::time::Clock;

/// What happened to an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Enqueued { job_id: String, position: usize, estimated_wait_secs: u64 },
    Inline { job_id: String },
    RateLimited { retry_after_secs: u64 },
    Saturated,
}

pub struct AdmissionService {
    /// Distributed limiter, present when redis is.
    primary_limiter: Option<Arc<dyn RateLimiter>>,
    fallback_limiter: Arc<dyn RateLimiter>,
    queue: Option<TaskQueue>,
    slots: JobSlots,
    orchestrator: Arc<PipelineOrchestrator>,
    store: Arc<dyn JobStore>,
    metrics: MetricsRegistry,
    clock: Arc<dyn Clock>,
    rate_limit_max: u32,
    fallback_rate_limit_max: u32,
    rate_limit_window: Duration,
}

#[allow(clippy::too_many_arguments)]
impl AdmissionService {
    pub fn new(
        primary_limiter: Option<Arc<dyn RateLimiter>>,
        fallback_limiter: Arc<dyn RateLimiter>,
        queue: Option<TaskQueue>,
        slots: JobSlots,
        orchestrator: Arc<PipelineOrchestrator>,
        store: Arc<dyn JobStore>,
        metrics: MetricsRegistry,
        clock: Arc<dyn Clock>,
        rate_limit_max: u32,
        fallback_rate_limit_max: u32,
        rate_limit_window: Duration,
    ) -> Self {
        Self {
            primary_limiter,
            fallback_limiter,
            queue,
            slots,
            orchestrator,
            store,
            metrics,
            clock,
            rate_limit_max,
            fallback_rate_limit_max,
            rate_limit_window,
        }
    }

    pub fn has_queue(&self) -> bool {
        self.queue.is_some()
    }

    pub fn queue(&self) -> Option<&TaskQueue> {
        self.queue.as_ref()
    }

    pub fn slots(&self) -> &JobSlots {
        &self.slots
    }

    /// Rate-check a principal. A failing distributed backend degrades to
    /// the in-process limiter instead of failing the request.
    pub async fn check_rate(&self, principal: &str) -> RateDecision {
        if let Some(primary) = &self.primary_limiter {
            match primary.check(principal, self.rate_limit_max, self.rate_limit_window).await {
                Ok(decision) => return decision,
                Err(error) => {
                    tracing::warn!(principal, error = %error, "distributed rate check failed, using fallback");
                    self.metrics.inc_counter("errors.rate_limit_backend");
                }
            }
        }
        match self
            .fallback_limiter
            .check(principal, self.fallback_rate_limit_max, self.rate_limit_window)
            .await
        {
            Ok(decision) => decision,
            // The in-process limiter is infallible in practice; refuse
            // politely if it ever is not.
            Err(error) => {
                tracing::error!(principal, error = %error, "fallback rate check failed");
                RateDecision::Denied { retry_after: Duration::from_secs(60) }
            }
        }
    }

    /// Full admission sequence for an async job.
    pub async fn admit(
        &self,
        user_id: &str,
        job_id: &str,
        kind: TaskKind,
        payload: &Value,
    ) -> Result<AdmissionOutcome, QueueError> {
        self.metrics.inc_counter(&format!("requests.{}", kind.as_str()));

        let decision = self.check_rate(user_id).await;
        if let RateDecision::Denied { retry_after } = decision {
            self.metrics.inc_counter("errors.rate_limited");
            return Ok(AdmissionOutcome::RateLimited { retry_after_secs: retry_after.as_secs() });
        }

        match &self.queue {
            Some(queue) => {
                let position = queue.enqueue(user_id, job_id, kind.clone(), payload).await?;
                let estimated_wait_secs = (position as u64 - 1) * kind.mean_duration_secs();
                // Mirror into the durable row so clients see it without
                // touching the queue.
                if let Err(error) = self
                    .store
                    .mark(
                        job_id,
                        "queued",
                        serde_json::json!({ "queue_position": position, "kind": kind.as_str() }),
                    )
                    .await
                {
                    tracing::warn!(job_id, error = %error, "queued status mirror failed");
                }
                Ok(AdmissionOutcome::Enqueued { job_id: job_id.to_string(), position, estimated_wait_secs })
            }
            None => {
                let Some(permit) = self.slots.try_acquire() else {
                    self.metrics.inc_counter("errors.saturated");
                    return Ok(AdmissionOutcome::Saturated);
                };
                let meta = JobMeta {
                    user_id: user_id.to_string(),
                    job_id: job_id.to_string(),
                    kind,
                    payload: payload.to_string(),
                    enqueued_at: self.clock.now(),
                    status: JobStatus::Processing,
                    retries: 0,
                    processing_started_at: Some(self.clock.now()),
                    last_error: None,
                };
                let orchestrator = self.orchestrator.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    // The orchestrator already records the outcome in the
                    // job row; nothing to do with the result here.
                    let _ = orchestrator.run(&meta).await;
                });
                Ok(AdmissionOutcome::Inline { job_id: job_id.to_string() })
            }
        }
    }

    /// Synchronous lane: rate-check only. Validation and single try-on
    /// endpoints respond in-request and never enqueue.
    pub async fn admit_sync(&self, user_id: &str, endpoint: &str) -> RateDecision {
        self.metrics.inc_counter(&format!("requests.{endpoint}"));
        let decision = self.check_rate(user_id).await;
        if !decision.is_allowed() {
            self.metrics.inc_counter("errors.rate_limited");
        }
        decision
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }
}
