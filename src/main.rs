//! Composition root: configuration, collaborator wiring, dispatcher,
//! HTTP server, shutdown.

use std::sync::Arc;
use std::time::Duration;

use atelier::admission::AdmissionService;
use atelier::config::Config;
use atelier::dispatcher::Dispatcher;
use atelier::guard::JobSlots;
use atelier::http::{self, AppState};
use atelier::jobstore::{JobStore, MemoryJobStore, RestJobStore};
use atelier::metrics::MetricsRegistry;
use atelier::pipeline::PipelineOrchestrator;
use atelier::providers::ProviderCatalog;
use atelier::queue::TaskQueue;
use atelier::rate_limit::{FallbackLimiter, RateLimiter, RedisRateLimiter};
use atelier::store::RedisBackend;
use atelier::time::{Clock, SystemClock, TokioSleeper};

/// Sweep cadence for the in-process rate window cleanup.
const FALLBACK_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,atelier=info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(error = %error, "configuration invalid");
            std::process::exit(1);
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sleeper = Arc::new(TokioSleeper);
    let metrics = MetricsRegistry::new(clock.clone());

    let http_client = match reqwest::Client::builder().timeout(Duration::from_secs(120)).build() {
        Ok(client) => client,
        Err(error) => {
            tracing::error!(error = %error, "could not build http client");
            std::process::exit(1);
        }
    };

    // Probe the distributed backend. Failure is not fatal: the service
    // degrades to inline execution with in-process rate limiting.
    let redis = match &config.redis_url {
        None => {
            tracing::warn!("REDIS_URL not set, running in fallback mode");
            None
        }
        Some(url) => match RedisBackend::connect(url).await {
            Ok(backend) => {
                tracing::info!("connected to redis queue backend");
                Some(backend)
            }
            Err(error) => {
                tracing::warn!(error = %error, "redis unreachable, running in fallback mode");
                None
            }
        },
    };

    let store: Arc<dyn JobStore> = match (&config.supabase_url, &config.supabase_service_role_key) {
        (Some(url), Some(key)) => {
            Arc::new(RestJobStore::new(url.clone(), key.clone(), http_client.clone()))
        }
        _ => {
            tracing::warn!("job store credentials not set, using in-memory job rows");
            Arc::new(MemoryJobStore::new())
        }
    };

    let providers = Arc::new(ProviderCatalog::new(
        &config,
        http_client.clone(),
        clock.clone(),
        sleeper.clone(),
    ));
    let orchestrator =
        Arc::new(PipelineOrchestrator::new(store.clone(), providers.clone(), metrics.clone()));

    let (queue, primary_limiter): (Option<TaskQueue>, Option<Arc<dyn RateLimiter>>) = match &redis {
        Some(backend) => (
            Some(TaskQueue::new(Arc::new(backend.clone()), clock.clone())),
            Some(Arc::new(RedisRateLimiter::new(backend.manager(), clock.clone()))),
        ),
        None => (None, None),
    };

    let fallback_limiter = Arc::new(FallbackLimiter::new(clock.clone()));
    let cleanup_limiter = fallback_limiter.clone();
    let cleanup_window = config.rate_limit_window;
    let cleanup = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FALLBACK_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            cleanup_limiter.cleanup_expired(cleanup_window);
        }
    });

    let dispatcher = queue.as_ref().map(|queue| {
        Dispatcher::new(queue.clone(), orchestrator.clone(), metrics.clone()).start()
    });

    let admission = Arc::new(AdmissionService::new(
        primary_limiter,
        fallback_limiter,
        queue,
        JobSlots::new(config.max_concurrent_jobs),
        orchestrator,
        store,
        metrics.clone(),
        clock.clone(),
        config.rate_limit_max,
        config.fallback_rate_limit_max,
        config.rate_limit_window,
    ));

    let state = AppState {
        admission,
        providers,
        metrics,
        autoscaler: config.autoscaler,
        shared_secret: config.worker_shared_secret.clone(),
        production: config.is_production(),
        clock,
    };

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%addr, error = %error, "could not bind listener");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, environment = %config.environment, "worker listening");

    if let Err(error) = axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %error, "server error");
    }

    cleanup.abort();
    if let Some(handle) = dispatcher {
        handle.stop().await;
    }
    tracing::info!("worker shut down cleanly");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("could not install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(error = %error, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
