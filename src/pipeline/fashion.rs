//! The fashion composition pipeline.
//!
//! identity-resolve → per-angle on-model generation → identity-lock
//! transfer → triptych composition → video synthesis → result commit.
//!
//! Per-angle generation tolerates partial failure: the angles are
//! independent contributions and quality degrades gracefully, so the job
//! only fails when zero angles survive. The failed angles are recorded in
//! provenance.

use futures::future::join_all;
use serde_json::{json, Value};

use super::{payloads::FashionJobPayload, PipelineOrchestrator};
use crate::error::PipelineError;
use crate::providers::{self, Tier};
use crate::queue::JobMeta;

const DEFAULT_ANIMATION_PROMPT: &str = "Cinematic fashion movement, slow motion, \
     keep identity consistent, editorial runway walk, smooth camera tracking, \
     professional lighting.";

pub(super) async fn run(
    orchestrator: &PipelineOrchestrator,
    meta: &JobMeta,
) -> Result<String, PipelineError> {
    let payload: FashionJobPayload = serde_json::from_str(&meta.payload)
        .map_err(|err| PipelineError::Payload(err.to_string()))?;
    let job_id = &meta.job_id;
    let identity = if payload.identity_id.is_empty() { &meta.user_id } else { &payload.identity_id };

    // ── identity-resolve ─────────────────────────────────────────────
    orchestrator.enter_stage(job_id, &meta.kind, "identity_resolve", 10, json!({})).await;
    let angles = orchestrator.store().angle_references(identity).await?;
    if angles.is_empty() {
        return Err(PipelineError::stage(
            "identity_resolve",
            format!("no reference images for identity {identity}"),
        ));
    }
    let face_refs = orchestrator.store().face_references(identity).await?;
    let face_ref = face_refs.first().cloned();
    // The front angle doubles as the body reference for animation.
    let body_ref = angles
        .iter()
        .find(|reference| reference.angle == "front")
        .map(|reference| reference.url.clone());

    // ── per-angle on-model generation (fan-out) ──────────────────────
    orchestrator.enter_stage(job_id, &meta.kind, "on_model", 25, json!({})).await;
    let category = payload.garment_category();
    let attempts = join_all(angles.iter().map(|reference| {
        let payload = providers::tryon_payload(
            &reference.url,
            &payload.garment_image_url,
            &category,
        );
        async move {
            let result = orchestrator.providers().tryon.run(&payload).await;
            (reference.angle.clone(), result)
        }
    }))
    .await;

    let mut renders: Vec<(String, String)> = Vec::new();
    let mut failed_angles: Vec<String> = Vec::new();
    for (angle, result) in attempts {
        match result {
            Ok(url) => renders.push((angle, url)),
            Err(error) => {
                tracing::warn!(%job_id, %angle, error = %error, "angle render failed");
                orchestrator.metrics().inc_counter("errors.angle_render");
                failed_angles.push(angle);
            }
        }
    }
    if renders.is_empty() {
        return Err(PipelineError::stage("on_model", "all angle renders failed"));
    }

    // ── identity-lock transfer ───────────────────────────────────────
    orchestrator.enter_stage(job_id, &meta.kind, "identity_lock", 45, json!({})).await;
    let locked = match &face_ref {
        None => {
            tracing::warn!(%job_id, "no face reference, skipping identity lock");
            renders.iter().map(|(_, url)| url.clone()).collect::<Vec<_>>()
        }
        Some(face_url) => {
            let swaps = join_all(renders.iter().map(|(angle, render_url)| {
                let payload = providers::identity_swap_payload(render_url, face_url);
                async move {
                    (angle.clone(), render_url.clone(), orchestrator.providers().identity_swap.run(&payload).await)
                }
            }))
            .await;
            swaps
                .into_iter()
                .map(|(angle, render_url, result)| match result {
                    Ok(url) => url,
                    Err(error) => {
                        // Keep the unswapped render rather than losing the
                        // angle entirely.
                        tracing::warn!(%job_id, %angle, error = %error, "identity lock failed, keeping raw render");
                        orchestrator.metrics().inc_counter("errors.identity_lock");
                        render_url
                    }
                })
                .collect::<Vec<_>>()
        }
    };

    // ── triptych composition ─────────────────────────────────────────
    orchestrator.enter_stage(job_id, &meta.kind, "composition", 60, json!({})).await;
    let (composite_url, composite_route) =
        compose_with_fallback(orchestrator, job_id, &locked, &payload.aspect_ratio).await?;

    // ── video synthesis ──────────────────────────────────────────────
    orchestrator
        .enter_stage(
            job_id,
            &meta.kind,
            "animation",
            80,
            json!({ "provider_task_id": Value::Null }),
        )
        .await;
    let mut ingredients = vec![composite_url.clone()];
    ingredients.extend(face_ref.clone());
    ingredients.extend(body_ref.clone());

    let tier = Tier::parse(&payload.tier());
    let model = payload.video_model().unwrap_or_else(|| tier.default_model().to_string());
    let prompt =
        payload.animation_prompt().unwrap_or_else(|| DEFAULT_ANIMATION_PROMPT.to_string());
    let video = orchestrator.providers().video_for(tier, &model);
    let output_url =
        video.run(&providers::video_payload(&prompt, &model, &ingredients, 5)).await?;

    // ── result commit ────────────────────────────────────────────────
    let provenance = json!({
        "angles": angles.iter().map(|reference| reference.angle.clone()).collect::<Vec<_>>(),
        "failed_angles": failed_angles,
        "renders": renders.iter().map(|(angle, url)| json!({"angle": angle, "url": url})).collect::<Vec<_>>(),
        "locked_renders": locked,
        "composite_url": composite_url,
        "composite_route": composite_route,
        "video_model": model,
    });
    orchestrator.commit(job_id, &output_url, provenance).await?;
    Ok(output_url)
}

/// Primary composition provider, falling back to chained try-on draping
/// when it errors. Returns the composite URL and which route produced it.
async fn compose_with_fallback(
    orchestrator: &PipelineOrchestrator,
    job_id: &str,
    image_urls: &[String],
    aspect_ratio: &str,
) -> Result<(String, &'static str), PipelineError> {
    let payload = providers::compose_payload(image_urls, aspect_ratio);
    match orchestrator.providers().compose.run(&payload).await {
        Ok(url) => Ok((url, "compose")),
        Err(error) => {
            tracing::warn!(%job_id, error = %error, "composition failed, falling back to layered try-on");
            orchestrator.metrics().inc_counter("errors.compose_primary");
            let mut base = image_urls
                .first()
                .cloned()
                .ok_or_else(|| PipelineError::stage("composition", "nothing to compose"))?;
            for layer in &image_urls[1..] {
                base = orchestrator
                    .providers()
                    .tryon
                    .run(&providers::tryon_payload(&base, layer, "auto"))
                    .await?;
            }
            Ok((base, "tryon_chain"))
        }
    }
}
