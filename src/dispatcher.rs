//! The queue consumer loop.
//!
//! One dispatcher runs per replica: dequeue → orchestrate → ack/nack.
//! Handler errors never kill the loop; only the shutdown signal does.
//! Horizontal scale happens at the replica level, driven by the
//! autoscaler, with the shared queue providing the global order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::metrics::MetricsRegistry;
use crate::pipeline::PipelineOrchestrator;
use crate::queue::{JobStatus, TaskQueue};

/// How long one dequeue blocks before the loop re-checks for shutdown.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
/// Idle cycles between periodic stale-recovery sweeps.
const RECOVER_EVERY_CYCLES: u32 = 60;

pub struct Dispatcher {
    queue: TaskQueue,
    orchestrator: Arc<PipelineOrchestrator>,
    metrics: MetricsRegistry,
    dequeue_timeout: Duration,
}

struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

/// Handle returned by [`Dispatcher::start`]; dropping it does not stop the
/// loop, calling [`stop`](DispatcherHandle::stop) does.
pub struct DispatcherHandle {
    shutdown: Arc<Shutdown>,
    join: tokio::task::JoinHandle<()>,
}

impl DispatcherHandle {
    pub async fn stop(self) {
        self.shutdown.requested.store(true, Ordering::SeqCst);
        self.shutdown.notify.notify_waiters();
        if self.join.await.is_err() {
            tracing::error!("dispatcher task panicked during shutdown");
        }
    }
}

impl Dispatcher {
    pub fn new(
        queue: TaskQueue,
        orchestrator: Arc<PipelineOrchestrator>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self { queue, orchestrator, metrics, dequeue_timeout: DEQUEUE_TIMEOUT }
    }

    /// Shorter dequeue blocking for tests.
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Run startup recovery and spawn the consumer loop.
    pub fn start(self) -> DispatcherHandle {
        let shutdown =
            Arc::new(Shutdown { requested: AtomicBool::new(false), notify: Notify::new() });
        let loop_shutdown = shutdown.clone();
        let join = tokio::spawn(async move {
            self.run(loop_shutdown).await;
        });
        DispatcherHandle { shutdown, join }
    }

    async fn run(self, shutdown: Arc<Shutdown>) {
        match self.queue.recover_stale().await {
            Ok(recovered) => {
                tracing::info!(recovered, "dispatcher startup recovery complete");
            }
            Err(error) => {
                tracing::error!(error = %error, "startup stale recovery failed");
            }
        }

        let mut cycles: u32 = 0;
        loop {
            if shutdown.requested.load(Ordering::SeqCst) {
                break;
            }
            cycles = cycles.wrapping_add(1);
            if cycles % RECOVER_EVERY_CYCLES == 0 {
                if let Err(error) = self.queue.recover_stale().await {
                    tracing::error!(error = %error, "periodic stale recovery failed");
                }
            }

            let dequeued = tokio::select! {
                result = self.queue.dequeue(self.dequeue_timeout) => result,
                _ = shutdown.notify.notified() => break,
            };

            match dequeued {
                Ok(Some(job_id)) => self.handle(&job_id).await,
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(error = %error, "dequeue failed");
                    self.metrics.inc_counter("errors.dequeue");
                    // Back off so a dead backend doesn't spin the loop.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        tracing::info!("dispatcher stopped");
    }

    async fn handle(&self, job_id: &str) {
        let meta = match self.queue.get_meta(job_id).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                // Metadata expired or was never written. Ack so the
                // processing list cannot wedge on a ghost entry.
                tracing::warn!(job_id, "dequeued job has no metadata, acking defensively");
                self.metrics.inc_counter("errors.missing_meta");
                if let Err(error) = self.queue.ack(job_id).await {
                    tracing::error!(job_id, error = %error, "defensive ack failed");
                }
                return;
            }
            Err(error) => {
                tracing::error!(job_id, error = %error, "metadata fetch failed, acking defensively");
                self.metrics.inc_counter("errors.meta_fetch");
                if let Err(error) = self.queue.ack(job_id).await {
                    tracing::error!(job_id, error = %error, "defensive ack failed");
                }
                return;
            }
        };

        if let Err(error) = self.queue.update_status(job_id, JobStatus::Processing).await {
            tracing::warn!(job_id, error = %error, "could not mark processing");
        }
        self.metrics.inc_counter("jobs.dequeued");

        let started = Instant::now();
        match self.orchestrator.run(&meta).await {
            Ok(output_url) => {
                self.metrics
                    .record_latency(meta.kind.as_str(), started.elapsed().as_secs_f64() * 1000.0);
                if let Err(error) = self.queue.ack(job_id).await {
                    tracing::error!(job_id, error = %error, "ack failed");
                } else {
                    tracing::info!(job_id, %output_url, "job completed");
                }
            }
            Err(error) => {
                self.metrics.inc_counter("errors.job_failed");
                if let Err(nack_error) = self.queue.nack(job_id, &error.to_string()).await {
                    tracing::error!(job_id, error = %nack_error, "nack failed");
                }
            }
        }
    }
}
