//! HTTP surface: auth, rate-limit responses, queue status, autoscale and
//! metrics endpoints, exercised through the router with in-memory
//! collaborators.

use std::sync::Arc;
use std::time::Duration;

use atelier::admission::AdmissionService;
use atelier::autoscaler::AutoscalerConfig;
use atelier::config::Config;
use atelier::guard::JobSlots;
use atelier::http::{router, AppState};
use atelier::jobstore::MemoryJobStore;
use atelier::metrics::MetricsRegistry;
use atelier::pipeline::PipelineOrchestrator;
use atelier::providers::ProviderCatalog;
use atelier::queue::TaskQueue;
use atelier::rate_limit::FallbackLimiter;
use atelier::store::MemoryBackend;
use atelier::time::{InstantSleeper, ManualClock};
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(secret: Option<&str>, production: bool, fallback_max: u32) -> Router {
    let clock = ManualClock::new(10_000.0);
    let metrics = MetricsRegistry::new(Arc::new(clock.clone()));
    let store = Arc::new(MemoryJobStore::new());
    let catalog = Arc::new(ProviderCatalog::new(
        &Config::from_lookup(|_| None).unwrap(),
        reqwest::Client::new(),
        Arc::new(clock.clone()),
        Arc::new(InstantSleeper),
    ));
    let orchestrator =
        Arc::new(PipelineOrchestrator::new(store.clone(), catalog.clone(), metrics.clone()));
    let queue = TaskQueue::new(Arc::new(MemoryBackend::new()), Arc::new(clock.clone()));
    let admission = Arc::new(AdmissionService::new(
        None,
        Arc::new(FallbackLimiter::new(Arc::new(clock.clone()))),
        Some(queue),
        JobSlots::new(3),
        orchestrator,
        store,
        metrics.clone(),
        Arc::new(clock.clone()),
        5,
        fallback_max,
        Duration::from_secs(3600),
    ));
    router(AppState {
        admission,
        providers: catalog,
        metrics,
        autoscaler: AutoscalerConfig::default(),
        shared_secret: secret.map(String::from),
        production,
        clock: Arc::new(clock),
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_generate(secret: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook/generate")
        .header("content-type", "application/json");
    if let Some(secret) = secret {
        builder = builder.header("x-worker-secret", secret);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let app = app(Some("s3cret"), false, 5);
    let response =
        app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue_backend"], "redis");
    assert_eq!(body["auth_configured"], true);
}

#[tokio::test]
async fn webhooks_reject_bad_or_missing_secrets() {
    let app = app(Some("s3cret"), false, 5);

    let missing = app
        .clone()
        .oneshot(post_generate(None, json!({"user_id": "u1", "prompt": "x"})))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .clone()
        .oneshot(post_generate(Some("nope"), json!({"user_id": "u1", "prompt": "x"})))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let right = app
        .oneshot(post_generate(Some("s3cret"), json!({"user_id": "u1", "prompt": "x"})))
        .await
        .unwrap();
    assert_eq!(right.status(), StatusCode::OK);
    let body = body_json(right).await;
    assert_eq!(body["status"], "queued");
    assert_eq!(body["position"], 1);
}

#[tokio::test]
async fn production_without_a_secret_refuses_webhooks() {
    let app = app(None, true, 5);
    let response = app
        .oneshot(post_generate(None, json!({"user_id": "u1", "prompt": "x"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn development_without_a_secret_runs_open() {
    let app = app(None, false, 5);
    let response = app
        .oneshot(post_generate(None, json!({"user_id": "u1", "prompt": "x"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_limited_requests_get_429_with_retry_after() {
    let app = app(None, false, 1);
    let first = app
        .clone()
        .oneshot(post_generate(None, json!({"user_id": "u1", "prompt": "x"})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(post_generate(None, json!({"user_id": "u1", "prompt": "x"})))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after =
        second.headers().get("retry-after").unwrap().to_str().unwrap().parse::<u64>().unwrap();
    assert!(retry_after >= 3600);
}

#[tokio::test]
async fn queue_status_reports_position_and_404s_unknown_jobs() {
    let app = app(None, false, 5);
    app.clone()
        .oneshot(post_generate(None, json!({"job_id": "q1", "user_id": "u1", "prompt": "x"})))
        .await
        .unwrap();

    let found = app
        .clone()
        .oneshot(
            Request::builder().uri("/queue/status?job_id=q1").body(Body::empty()).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(found.status(), StatusCode::OK);
    let body = body_json(found).await;
    assert_eq!(body["status"], "queued");
    assert_eq!(body["position"], 1);
    assert_eq!(body["queue_length"], 1);

    let unknown = app
        .oneshot(
            Request::builder().uri("/queue/status?job_id=nope").body(Body::empty()).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn autoscale_reflects_queue_depth() {
    let app = app(None, false, 5);
    let idle = app
        .clone()
        .oneshot(Request::builder().uri("/autoscale").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(idle).await;
    assert_eq!(body["desired_replicas"], 1);
    assert_eq!(body["reason"], "idle");

    // Six queued jobs want a second replica.
    for i in 0..6 {
        app.clone()
            .oneshot(post_generate(
                None,
                json!({"job_id": format!("job-{i}"), "user_id": format!("user-{i}"), "prompt": "x"}),
            ))
            .await
            .unwrap();
    }
    let busy = app
        .oneshot(Request::builder().uri("/autoscale").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(busy).await;
    assert_eq!(body["total_load"], 6);
    assert_eq!(body["desired_replicas"], 2);
}

#[tokio::test]
async fn metrics_snapshot_counts_webhook_traffic() {
    let app = app(None, false, 5);
    app.clone()
        .oneshot(post_generate(None, json!({"user_id": "u1", "prompt": "x"})))
        .await
        .unwrap();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["counters"]["requests.video_generate"], 1);
    assert!(body["timeseries"]["requests.video_generate"].as_array().unwrap().len() == 60);
}
