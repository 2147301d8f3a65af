//! End-to-end dispatcher runs: enqueue → dequeue → orchestrate →
//! ack/nack, against in-memory queue and job store plus a mock provider.

use std::sync::Arc;
use std::time::Duration;

use atelier::config::Config;
use atelier::dispatcher::Dispatcher;
use atelier::jobstore::{AngleReference, JobStore, MemoryJobStore};
use atelier::metrics::MetricsRegistry;
use atelier::pipeline::PipelineOrchestrator;
use atelier::providers::ProviderCatalog;
use atelier::queue::{JobStatus, TaskKind, TaskQueue};
use atelier::store::MemoryBackend;
use atelier::time::{InstantSleeper, ManualClock};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    queue: TaskQueue,
    backend: MemoryBackend,
    clock: ManualClock,
    store: Arc<MemoryJobStore>,
    orchestrator: Arc<PipelineOrchestrator>,
    metrics: MetricsRegistry,
}

fn harness(provider_base: &str) -> Harness {
    let clock = ManualClock::new(50_000.0);
    let metrics = MetricsRegistry::new(Arc::new(clock.clone()));
    let store = Arc::new(MemoryJobStore::new());
    let config = Config::from_lookup(|name| match name {
        "TRYON_BASE_URL" | "VIDEO_BASE_URL" | "COMPOSE_BASE_URL" => {
            Some(provider_base.to_string())
        }
        "FAL_API_KEY" | "KIE_API_KEY" | "CLAID_API_KEY" => Some("test-key".to_string()),
        _ => None,
    })
    .unwrap();
    let catalog = Arc::new(ProviderCatalog::new(
        &config,
        reqwest::Client::new(),
        Arc::new(clock.clone()),
        Arc::new(InstantSleeper),
    ));
    let orchestrator =
        Arc::new(PipelineOrchestrator::new(store.clone(), catalog, metrics.clone()));
    let backend = MemoryBackend::new();
    let queue = TaskQueue::new(Arc::new(backend.clone()), Arc::new(clock.clone()));
    Harness { queue, backend, clock, store, orchestrator, metrics }
}

fn dispatcher(harness: &Harness) -> Dispatcher {
    Dispatcher::new(harness.queue.clone(), harness.orchestrator.clone(), harness.metrics.clone())
        .with_dequeue_timeout(Duration::from_millis(50))
}

/// Poll the job row until it reaches a terminal status.
async fn wait_for_status(store: &MemoryJobStore, job_id: &str, status: &str) {
    for _ in 0..200 {
        if let Ok(row) = store.get(job_id).await {
            if row.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached status {status}");
}

async fn mount_video_success(server: &MockServer, task_id: &str, output_url: &str) {
    Mock::given(method("POST"))
        .and(path("/veo/generate"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"task_id": task_id}})),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/veo/record-info"))
        .and(query_param("taskId", task_id))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"data": {"status": "SUCCESS", "video_url": output_url}}),
        ))
        .mount(server)
        .await;
}

#[tokio::test]
async fn happy_path_runs_a_video_job_to_completion() {
    let server = MockServer::start().await;
    mount_video_success(&server, "t1", "https://cdn/final.mp4").await;

    let harness = harness(&server.uri());
    harness
        .queue
        .enqueue(
            "u1",
            "j1",
            TaskKind::VideoGenerate,
            &json!({"prompt": "editorial walk", "model": "veo-3.1-fast"}),
        )
        .await
        .unwrap();

    let handle = dispatcher(&harness).start();
    wait_for_status(&harness.store, "j1", "completed").await;
    handle.stop().await;

    let row = harness.store.get("j1").await.unwrap();
    assert_eq!(row.field_str("output_url"), Some("https://cdn/final.mp4"));
    // Status row passed through processing before completing.
    assert!(harness.store.status_history("j1").contains(&"processing".to_string()));

    let meta = harness.queue.get_meta("j1").await.unwrap().unwrap();
    assert_eq!(meta.status, JobStatus::Completed);
    assert_eq!(harness.queue.pending_len().await.unwrap(), 0);
    assert_eq!(harness.queue.processing_len().await.unwrap(), 0);
}

#[tokio::test]
async fn repeated_failures_dead_letter_the_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/veo/generate"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({"detail": "model not available"})),
        )
        .mount(&server)
        .await;

    let harness = harness(&server.uri());
    harness
        .queue
        .enqueue("u1", "j2", TaskKind::VideoGenerate, &json!({"prompt": "x"}))
        .await
        .unwrap();

    let handle = dispatcher(&harness).start();
    for _ in 0..200 {
        if harness.queue.list_dead(10).await.unwrap().contains(&"j2".to_string()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await;

    assert_eq!(harness.queue.list_dead(10).await.unwrap(), vec!["j2"]);
    let meta = harness.queue.get_meta("j2").await.unwrap().unwrap();
    assert_eq!(meta.status, JobStatus::DeadLetter);
    assert_eq!(meta.retries, 3);

    let row = harness.store.get("j2").await.unwrap();
    assert_eq!(row.status, "failed");
    assert!(row.field_str("error_message").unwrap().contains("422"));

    // Manual resurrection puts it back in line.
    assert!(harness.queue.retry_dead("j2").await.unwrap());
    assert_eq!(harness.queue.pending_len().await.unwrap(), 1);
}

#[tokio::test]
async fn startup_recovery_rescues_an_abandoned_job() {
    let server = MockServer::start().await;
    mount_video_success(&server, "t4", "https://cdn/recovered.mp4").await;

    let harness = harness(&server.uri());
    harness
        .queue
        .enqueue("u1", "j4", TaskKind::VideoGenerate, &json!({"prompt": "x"}))
        .await
        .unwrap();

    // A worker dequeued the job and died mid-stage.
    let taken = harness.queue.dequeue(Duration::from_millis(50)).await.unwrap();
    assert_eq!(taken.as_deref(), Some("j4"));
    assert_eq!(harness.queue.processing_len().await.unwrap(), 1);

    // Past the stale timeout, a fresh dispatcher's startup recovery
    // requeues and runs it.
    harness.clock.advance(601.0);
    let handle = dispatcher(&harness).start();
    wait_for_status(&harness.store, "j4", "completed").await;
    handle.stop().await;

    let row = harness.store.get("j4").await.unwrap();
    assert_eq!(row.field_str("output_url"), Some("https://cdn/recovered.mp4"));
    assert_eq!(harness.queue.processing_len().await.unwrap(), 0);
}

#[tokio::test]
async fn fashion_pipeline_tolerates_a_failed_angle() {
    let server = MockServer::start().await;

    // Try-on per angle: front and three-quarter succeed, side fails.
    for (angle_url, request_id, render) in [
        ("https://cdn/front.png", "rf", "https://cdn/render-front.png"),
        ("https://cdn/three_quarter.png", "rq", "https://cdn/render-quarter.png"),
    ] {
        Mock::given(method("POST"))
            .and(path("/fal-ai/fashn/tryon/v1.6"))
            .and(body_partial_json(json!({"model_image": angle_url})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"request_id": request_id})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/fal-ai/fashn/tryon/v1.6/requests/{request_id}/status")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "COMPLETED"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/fal-ai/fashn/tryon/v1.6/requests/{request_id}")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"images": [{"url": render}]})),
            )
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/fal-ai/fashn/tryon/v1.6"))
        .and(body_partial_json(json!({"model_image": "https://cdn/side.png"})))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({"detail": "blurred"})))
        .mount(&server)
        .await;

    // Composition answers synchronously; animation goes through the
    // standard video provider.
    Mock::given(method("POST"))
        .and(path("/image/ai-fashion-models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"data": {"output": {"url": "https://cdn/composite.png"}}}),
        ))
        .mount(&server)
        .await;
    mount_video_success(&server, "tv", "https://cdn/fashion-video.mp4").await;

    let harness = harness(&server.uri());
    harness.store.set_angle_references(
        "u1",
        vec![
            AngleReference { angle: "front".into(), url: "https://cdn/front.png".into() },
            AngleReference { angle: "side".into(), url: "https://cdn/side.png".into() },
            AngleReference {
                angle: "three_quarter".into(),
                url: "https://cdn/three_quarter.png".into(),
            },
        ],
    );
    harness.store.set_face_references("u1", vec![]);

    harness
        .queue
        .enqueue(
            "u1",
            "j7",
            TaskKind::FashionGenerate,
            &json!({"garment_image_url": "https://cdn/garment.png"}),
        )
        .await
        .unwrap();

    let handle = dispatcher(&harness).start();
    wait_for_status(&harness.store, "j7", "completed").await;
    handle.stop().await;

    let row = harness.store.get("j7").await.unwrap();
    assert_eq!(row.field_str("output_url"), Some("https://cdn/fashion-video.mp4"));
    let provenance = row.fields.get("provenance").unwrap();
    assert_eq!(provenance["failed_angles"], json!(["side"]));
    assert_eq!(provenance["composite_route"], json!("compose"));
    assert_eq!(provenance["composite_url"], json!("https://cdn/composite.png"));
}

#[tokio::test]
async fn orchestrator_reentry_is_idempotent() {
    let server = MockServer::start().await;
    mount_video_success(&server, "t5", "https://cdn/same.mp4").await;

    let harness = harness(&server.uri());
    harness
        .queue
        .enqueue("u1", "j5", TaskKind::VideoGenerate, &json!({"prompt": "x"}))
        .await
        .unwrap();
    let meta = harness.queue.get_meta("j5").await.unwrap().unwrap();

    // A retry re-runs the whole pipeline with identical inputs; the job
    // row converges on the same terminal state.
    let first = harness.orchestrator.run(&meta).await.unwrap();
    let row_after_first = harness.store.get("j5").await.unwrap();
    let second = harness.orchestrator.run(&meta).await.unwrap();
    let row_after_second = harness.store.get("j5").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(row_after_first.status, "completed");
    assert_eq!(row_after_second.status, "completed");
    assert_eq!(
        row_after_first.field_str("output_url"),
        row_after_second.field_str("output_url"),
    );
}

#[tokio::test]
async fn expired_metadata_is_acked_defensively() {
    let server = MockServer::start().await;
    let harness = harness(&server.uri());

    harness
        .queue
        .enqueue("u1", "ghost", TaskKind::VideoGenerate, &json!({"prompt": "x"}))
        .await
        .unwrap();
    // Simulate TTL expiry before the dispatcher gets to the job.
    harness.backend.expire_hash("taskqueue:meta:ghost");

    let handle = dispatcher(&harness).start();
    for _ in 0..100 {
        if harness.queue.pending_len().await.unwrap() == 0
            && harness.queue.processing_len().await.unwrap() == 0
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await;

    // Neither retried nor dead-lettered: the ghost entry was dropped.
    assert_eq!(harness.queue.pending_len().await.unwrap(), 0);
    assert_eq!(harness.queue.processing_len().await.unwrap(), 0);
    assert!(harness.queue.list_dead(10).await.unwrap().is_empty());
    // No provider call was ever made for it.
    assert!(server.received_requests().await.unwrap().is_empty());
}
