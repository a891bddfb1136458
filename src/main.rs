//! Engine worker binary: storage, registry, queue, workers, scheduler and
//! the HTTP surface wired together with in-process implementations.

use std::sync::Arc;

use anyhow::Context;
use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use conflux::engine::ApprovalHub;
use conflux::queue::{MemoryJobQueue, WorkerPool};
use conflux::ratelimit::RateLimiter;
use conflux::sandbox::{
    HttpClientConfig, PooledHttpClient, Sandbox, SandboxConfig, SandboxServices,
};
use conflux::scheduler::Scheduler;
use conflux::storage::MemoryStore;
use conflux::webhook::{router, AppState, RunService, WebhookIngress};
use conflux::{BlockRegistry, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(
        BlockRegistry::with_system_blocks(settings.inheritance_max_depth)
            .context("failed to seed system blocks")?,
    );
    let sandbox = Arc::new(Sandbox::new(SandboxConfig {
        default_timeout: settings.sandbox_timeout,
        ..SandboxConfig::default()
    }));

    let http_client = Arc::new(
        PooledHttpClient::new(HttpClientConfig::default())
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?,
    );
    let base_services = SandboxServices::noop().with_http(http_client);

    let queue = Arc::new(MemoryJobQueue::new());
    let approvals = Arc::new(ApprovalHub::new(store.clone()));
    let limiter = Arc::new(RateLimiter::new(settings.rate_limit.clone()));

    let shutdown = CancellationToken::new();

    let workers = Arc::new(
        WorkerPool::new(
            queue.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            registry.clone(),
            sandbox.clone(),
            base_services,
            approvals.clone(),
        )
        .with_concurrency(settings.worker_concurrency)
        .with_step_timeout(settings.sandbox_timeout),
    );
    let worker_handles = workers.clone().spawn(shutdown.clone());

    let scheduler = Arc::new(
        Scheduler::new(store.clone(), store.clone(), queue.clone())
            .with_tick_interval(settings.scheduler_tick),
    );
    let scheduler_handle = scheduler.spawn(shutdown.clone());

    let ingress = Arc::new(
        WebhookIngress::new(
            store.clone(),
            store.clone(),
            queue.clone(),
            store.clone(),
            limiter,
        )
        .with_clock_skew(settings.webhook_clock_skew_seconds)
        .with_idempotency_ttl(ChronoDuration::hours(settings.idempotency_ttl_hours)),
    );
    let runs = Arc::new(RunService::new(store.clone(), store.clone(), queue.clone()));
    let app = router(Arc::new(AppState { ingress, runs }));

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "engine listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    scheduler_handle.abort();
    for handle in worker_handles {
        let _ = handle.await;
    }
    Ok(())
}
