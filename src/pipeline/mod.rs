//! Pipeline orchestration.
//!
//! A job is a state machine driven here: every stage entry writes the
//! external job row (status, current stage, progress), every stage exit
//! records its artifacts into the row's provenance, and any uncaught
//! stage error flips the row to `failed` (message truncated) before being
//! rethrown for the dispatcher to nack. Stages key their outputs by job
//! id, so a retried job overwrites rather than duplicates.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{truncate_message, PipelineError};
use crate::jobstore::JobStore;
use crate::metrics::MetricsRegistry;
use crate::providers::ProviderCatalog;
use crate::queue::{JobMeta, TaskKind};

mod fashion;
mod generic;
mod payloads;

pub use payloads::{
    ExtendPayload, FashionJobPayload, TryOnPayload, UpscalePayload, VideoJobPayload,
};

/// Error messages written to the job row are bounded.
const MAX_ROW_ERROR: usize = 200;

pub struct PipelineOrchestrator {
    store: Arc<dyn JobStore>,
    providers: Arc<ProviderCatalog>,
    metrics: MetricsRegistry,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        providers: Arc<ProviderCatalog>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self { store, providers, metrics }
    }

    /// Run the pipeline for a job to completion. Returns the output URL.
    ///
    /// On failure the job row is marked `failed` with the truncated error
    /// and the error is rethrown so the queue layer can retry or
    /// dead-letter.
    pub async fn run(&self, meta: &JobMeta) -> Result<String, PipelineError> {
        let result = self.dispatch(meta).await;
        match result {
            Ok(output_url) => {
                self.metrics.inc_counter("jobs.completed");
                Ok(output_url)
            }
            Err(error) => {
                self.metrics.inc_counter("errors.pipeline");
                self.metrics.record_error(
                    meta.kind.as_str(),
                    "pipeline",
                    &error.to_string(),
                    &meta.user_id,
                );
                let message = truncate_message(&error.to_string(), MAX_ROW_ERROR);
                if let Err(store_error) = self
                    .store
                    .mark(&meta.job_id, "failed", json!({ "error_message": message }))
                    .await
                {
                    tracing::error!(
                        job_id = %meta.job_id,
                        error = %store_error,
                        "failed to write failure status"
                    );
                }
                Err(error)
            }
        }
    }

    async fn dispatch(&self, meta: &JobMeta) -> Result<String, PipelineError> {
        match &meta.kind {
            TaskKind::FashionGenerate => fashion::run(self, meta).await,
            TaskKind::VideoGenerate => generic::run_video(self, meta).await,
            TaskKind::TryOn => generic::run_tryon(self, meta).await,
            TaskKind::Extend => generic::run_extend(self, meta).await,
            TaskKind::Upscale => generic::run_upscale(self, meta).await,
            TaskKind::Other(kind) => {
                Err(PipelineError::Payload(format!("unroutable task kind {kind:?}")))
            }
        }
    }

    pub(crate) fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    pub(crate) fn providers(&self) -> &ProviderCatalog {
        &self.providers
    }

    pub(crate) fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Stage-entry bookkeeping: status row write plus a progress log line.
    /// Store hiccups here are logged and swallowed — only the final commit
    /// is load-bearing.
    pub(crate) async fn enter_stage(
        &self,
        job_id: &str,
        kind: &TaskKind,
        stage: &'static str,
        progress_pct: u8,
        extra: Value,
    ) {
        tracing::info!(job_id, kind = kind.as_str(), stage, progress_pct, "entering stage");
        let mut fields = json!({
            "kind": kind.as_str(),
            "current_stage": stage,
            "progress_pct": progress_pct,
        });
        if let (Value::Object(fields_map), Value::Object(extra_map)) = (&mut fields, extra) {
            for (key, value) in extra_map {
                fields_map.insert(key, value);
            }
        }
        if let Err(error) = self.store.mark(job_id, "processing", fields).await {
            tracing::warn!(job_id, stage, error = %error, "stage status write failed");
        }
    }

    /// Final commit: completed status plus output and provenance. This
    /// write is load-bearing; an error fails the job.
    pub(crate) async fn commit(
        &self,
        job_id: &str,
        output_url: &str,
        provenance: Value,
    ) -> Result<(), PipelineError> {
        self.store
            .mark(
                job_id,
                "completed",
                json!({
                    "output_url": output_url,
                    "progress_pct": 100,
                    "current_stage": "done",
                    "provenance": provenance,
                }),
            )
            .await?;
        Ok(())
    }
}
