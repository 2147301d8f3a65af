//! The webhook HTTP surface.
//!
//! Thin glue: handlers parse, delegate to [`AdmissionService`] or the
//! relevant collaborator, and shape the response. `/webhook/*` requires
//! the shared-secret header; everything else is public.

use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::admission::{AdmissionOutcome, AdmissionService};
use crate::autoscaler::{self, AutoscalerConfig};
use crate::metrics::MetricsRegistry;
use crate::pipeline::TryOnPayload;
use crate::providers::ProviderCatalog;
use crate::queue::{JobMeta, JobStatus, TaskKind};

#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionService>,
    pub providers: Arc<ProviderCatalog>,
    pub metrics: MetricsRegistry,
    pub autoscaler: AutoscalerConfig,
    pub shared_secret: Option<String>,
    pub production: bool,
    pub clock: Arc<dyn crate::time::Clock>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_snapshot))
        .route("/autoscale", get(autoscale))
        .route("/queue/status", get(queue_status))
        .route("/webhook/generate", post(generate))
        .route("/webhook/fashion-generate", post(fashion_generate))
        .route("/webhook/extend", post(extend))
        .route("/webhook/upscale", post(upscale))
        .route("/webhook/try-on", post(try_on))
        .route("/webhook/validate-selfie", post(validate_selfie))
        .layer(middleware::from_fn_with_state(state.clone(), auth_and_latency))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Timing-safe equality; never shortcuts on the first mismatched byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Shared-secret check on `/webhook/*` plus per-endpoint latency samples.
async fn auth_and_latency(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if path.starts_with("/webhook") {
        match &state.shared_secret {
            None => {
                // Development without a secret runs open; production
                // refuses to serve rather than serve unauthenticated.
                if state.production {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"detail": "WORKER_SHARED_SECRET not configured"})),
                    )
                        .into_response();
                }
            }
            Some(secret) => {
                let provided = request
                    .headers()
                    .get("x-worker-secret")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("");
                if !constant_time_eq(provided.as_bytes(), secret.as_bytes()) {
                    state.metrics.inc_counter("errors.auth");
                    return (
                        StatusCode::UNAUTHORIZED,
                        Json(json!({"detail": "Invalid or missing worker secret"})),
                    )
                        .into_response();
                }
            }
        }
    }

    let started = Instant::now();
    let response = next.run(request).await;
    state.metrics.record_latency(&path, started.elapsed().as_secs_f64() * 1000.0);
    response
}

// ── Public endpoints ─────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "queue_backend": if state.admission.has_queue() { "redis" } else { "memory-fallback" },
        "auth_configured": state.shared_secret.is_some(),
        "active_inline_jobs": state.admission.slots().active(),
    }))
}

async fn metrics_snapshot(State(state): State<AppState>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn autoscale(State(state): State<AppState>) -> Response {
    let (pending, in_flight) = match state.admission.queue() {
        Some(queue) => {
            let pending = queue.pending_len().await.unwrap_or(0);
            let in_flight = queue.processing_len().await.unwrap_or(0);
            (pending, in_flight)
        }
        None => (0, state.admission.slots().active()),
    };
    let decision = autoscaler::decide(&state.autoscaler, pending, in_flight);
    state.metrics.set_gauge("queue_depth", pending as f64);
    state.metrics.set_gauge("active_jobs", in_flight as f64);
    Json(decision).into_response()
}

#[derive(Deserialize)]
struct QueueStatusQuery {
    job_id: String,
}

async fn queue_status(
    State(state): State<AppState>,
    Query(query): Query<QueueStatusQuery>,
) -> Response {
    let Some(queue) = state.admission.queue() else {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "queue not available"})))
            .into_response();
    };
    let meta = match queue.get_meta(&query.job_id).await {
        Ok(Some(meta)) => meta,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, Json(json!({"detail": "job not found"})))
                .into_response();
        }
        Err(error) => {
            tracing::error!(job_id = %query.job_id, error = %error, "queue status lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"detail": "queue error"})))
                .into_response();
        }
    };
    let position = queue.position(&query.job_id).await.ok().flatten();
    let estimated_wait = queue.estimate_wait(&query.job_id).await.unwrap_or(0);
    let queue_length = queue.pending_len().await.unwrap_or(0);
    Json(json!({
        "job_id": query.job_id,
        "status": meta.status.as_str(),
        "position": position,
        "estimated_wait_seconds": estimated_wait,
        "queue_length": queue_length,
    }))
    .into_response()
}

// ── Webhook endpoints ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    job_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(flatten)]
    payload: Value,
}

fn principal(user_id: &str) -> &str {
    if user_id.is_empty() {
        "anonymous"
    } else {
        user_id
    }
}

fn job_id_or_new(job_id: &str) -> String {
    if job_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        job_id.to_string()
    }
}

async fn admit_and_respond(
    state: &AppState,
    request: GenerateRequest,
    kind: TaskKind,
) -> Response {
    let job_id = job_id_or_new(&request.job_id);
    let user = principal(&request.user_id).to_string();
    match state.admission.admit(&user, &job_id, kind, &request.payload).await {
        Ok(AdmissionOutcome::Enqueued { job_id, position, estimated_wait_secs }) => Json(json!({
            "job_id": job_id,
            "status": "queued",
            "position": position,
            "estimated_wait_seconds": estimated_wait_secs,
        }))
        .into_response(),
        Ok(AdmissionOutcome::Inline { job_id }) => {
            Json(json!({ "job_id": job_id, "status": "processing" })).into_response()
        }
        Ok(AdmissionOutcome::RateLimited { retry_after_secs }) => {
            rate_limited_response(retry_after_secs)
        }
        Ok(AdmissionOutcome::Saturated) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"detail": "worker at capacity, try again shortly"})),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(%job_id, error = %error, "admission failed");
            state.metrics.inc_counter("errors.admission");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"detail": "enqueue failed"})))
                .into_response()
        }
    }
}

async fn generate(State(state): State<AppState>, Json(request): Json<GenerateRequest>) -> Response {
    admit_and_respond(&state, request, TaskKind::VideoGenerate).await
}

async fn fashion_generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    admit_and_respond(&state, request, TaskKind::FashionGenerate).await
}

async fn extend(State(state): State<AppState>, Json(request): Json<GenerateRequest>) -> Response {
    admit_and_respond(&state, request, TaskKind::Extend).await
}

async fn upscale(State(state): State<AppState>, Json(request): Json<GenerateRequest>) -> Response {
    admit_and_respond(&state, request, TaskKind::Upscale).await
}

fn rate_limited_response(retry_after_secs: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", retry_after_secs.to_string())],
        Json(json!({
            "detail": "rate limit exceeded",
            "retry_after_seconds": retry_after_secs,
        })),
    )
        .into_response()
}

/// Synchronous single-stage try-on: responds with the output URL
/// in-request. Rate limited, never enqueued.
async fn try_on(State(state): State<AppState>, Json(request): Json<GenerateRequest>) -> Response {
    let user = principal(&request.user_id).to_string();
    let decision = state.admission.admit_sync(&user, "try_on").await;
    if !decision.is_allowed() {
        return rate_limited_response(decision.retry_after_secs());
    }

    let parsed: Result<TryOnPayload, _> = serde_json::from_value(request.payload.clone());
    if let Err(error) = parsed {
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"detail": error.to_string()})))
            .into_response();
    }

    let job_id = job_id_or_new(&request.job_id);
    let meta = JobMeta {
        user_id: user,
        job_id: job_id.clone(),
        kind: TaskKind::TryOn,
        payload: request.payload.to_string(),
        enqueued_at: state.clock.now(),
        status: JobStatus::Processing,
        retries: 0,
        processing_started_at: Some(state.clock.now()),
        last_error: None,
    };
    match state.admission.orchestrator().run(&meta).await {
        Ok(output_url) => {
            Json(json!({ "job_id": job_id, "status": "completed", "output_url": output_url }))
                .into_response()
        }
        Err(error) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "job_id": job_id, "detail": error.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct ValidateSelfieRequest {
    #[serde(default)]
    user_id: String,
    image_url: String,
}

/// Synchronous pass-through to the validation provider.
async fn validate_selfie(
    State(state): State<AppState>,
    Json(request): Json<ValidateSelfieRequest>,
) -> Response {
    let user = principal(&request.user_id).to_string();
    let decision = state.admission.admit_sync(&user, "validate_selfie").await;
    if !decision.is_allowed() {
        return rate_limited_response(decision.retry_after_secs());
    }

    let payload = json!({
        "contents": [{
            "parts": [
                { "text": "Assess this selfie for identity-reference quality. Reply with JSON: \
                           {\"usable\": bool, \"face_visible\": bool, \"resolution_ok\": bool, \
                           \"issues\": [string]}" },
                { "file_data": { "file_uri": request.image_url } },
            ],
        }],
    });
    match state.providers.validate.invoke(&payload).await {
        Ok(body) => Json(json!({ "status": "ok", "result": body })).into_response(),
        Err(error) => {
            state.metrics.inc_counter("errors.validate");
            (StatusCode::BAD_GATEWAY, Json(json!({"detail": error.to_string()}))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_handles_lengths_and_content() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secres"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn blank_principals_collapse_to_anonymous() {
        assert_eq!(principal(""), "anonymous");
        assert_eq!(principal("u1"), "u1");
    }

    #[test]
    fn missing_job_ids_get_generated() {
        assert_eq!(job_id_or_new("given"), "given");
        let generated = job_id_or_new("");
        assert_eq!(generated.len(), 36);
    }
}
