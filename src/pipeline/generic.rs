//! Single-gateway pipelines: generic video, try-on, extend, upscale.
//!
//! These are the degenerate shape — status=processing, provider submit,
//! poll, status=completed — parameterized by which gateway and payload
//! they use.

use serde_json::json;

use super::payloads::{ExtendPayload, TryOnPayload, UpscalePayload, VideoJobPayload};
use super::PipelineOrchestrator;
use crate::error::PipelineError;
use crate::providers::{self, Tier};
use crate::queue::JobMeta;

pub(super) async fn run_video(
    orchestrator: &PipelineOrchestrator,
    meta: &JobMeta,
) -> Result<String, PipelineError> {
    let payload: VideoJobPayload = serde_json::from_str(&meta.payload)
        .map_err(|err| PipelineError::Payload(err.to_string()))?;

    let tier = Tier::parse(&payload.tier);
    let model = if payload.model.is_empty() {
        tier.default_model().to_string()
    } else {
        payload.model.clone()
    };
    orchestrator
        .enter_stage(&meta.job_id, &meta.kind, "generation", 20, json!({ "model": model }))
        .await;

    let gateway = orchestrator.providers().video_for(tier, &model);
    let request =
        providers::video_payload(&payload.prompt, &model, &payload.image_refs, payload.duration);
    let output_url = gateway.run(&request).await?;

    orchestrator
        .commit(&meta.job_id, &output_url, json!({ "model": model, "provider": gateway.name() }))
        .await?;
    Ok(output_url)
}

pub(super) async fn run_tryon(
    orchestrator: &PipelineOrchestrator,
    meta: &JobMeta,
) -> Result<String, PipelineError> {
    let payload: TryOnPayload = serde_json::from_str(&meta.payload)
        .map_err(|err| PipelineError::Payload(err.to_string()))?;

    orchestrator.enter_stage(&meta.job_id, &meta.kind, "tryon", 20, json!({})).await;
    let request = providers::tryon_payload(
        &payload.model_image_url,
        &payload.garment_image_url,
        &payload.category,
    );
    let output_url = orchestrator.providers().tryon.run(&request).await?;

    orchestrator.commit(&meta.job_id, &output_url, json!({ "category": payload.category })).await?;
    Ok(output_url)
}

pub(super) async fn run_extend(
    orchestrator: &PipelineOrchestrator,
    meta: &JobMeta,
) -> Result<String, PipelineError> {
    let payload: ExtendPayload = serde_json::from_str(&meta.payload)
        .map_err(|err| PipelineError::Payload(err.to_string()))?;

    let tier = Tier::parse(&payload.tier);
    let model = if payload.model.is_empty() {
        tier.default_model().to_string()
    } else {
        payload.model.clone()
    };
    orchestrator
        .enter_stage(&meta.job_id, &meta.kind, "extend", 20, json!({ "model": model }))
        .await;

    let gateway = orchestrator.providers().video_for(tier, &model);
    let ingredients = vec![payload.source_output_url.clone()];
    let request =
        providers::video_payload(&payload.prompt, &model, &ingredients, payload.duration);
    let output_url = gateway.run(&request).await?;

    orchestrator
        .commit(
            &meta.job_id,
            &output_url,
            json!({ "source": payload.source_output_url, "model": model }),
        )
        .await?;
    Ok(output_url)
}

pub(super) async fn run_upscale(
    orchestrator: &PipelineOrchestrator,
    meta: &JobMeta,
) -> Result<String, PipelineError> {
    let payload: UpscalePayload = serde_json::from_str(&meta.payload)
        .map_err(|err| PipelineError::Payload(err.to_string()))?;

    let mode = if payload.mode.is_empty() { "gentle".to_string() } else { payload.mode.clone() };
    orchestrator
        .enter_stage(&meta.job_id, &meta.kind, "upscale", 20, json!({ "mode": mode }))
        .await;

    let request = providers::upscale_payload(&payload.image_url, &mode);
    let output_url = orchestrator.providers().upscale.run(&request).await?;

    orchestrator
        .commit(&meta.job_id, &output_url, json!({ "mode": mode, "source": payload.image_url }))
        .await?;
    Ok(output_url)
}
