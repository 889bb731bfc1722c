mod config;
mod intake;
mod server;
mod sink;

use anyhow::Context;
use arbiter_common::config::process_env;
use arbiter_engine::{
    AvailabilityGate, DockerSandbox, EngineConfig, LanguageRegistry, QueueConfig, SandboxBackend,
    SubmissionQueue, TestCaseExecutor,
};
use config::WorkerConfig;
use sink::RedisResultSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

async fn redis_connection(client: &::redis::Client) -> anyhow::Result<::redis::aio::ConnectionManager> {
    ::redis::aio::ConnectionManager::new(client.clone())
        .await
        .context("Failed to connect to Redis")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let worker_config = WorkerConfig::from_env();
    init_tracing(worker_config.json_logs);

    info!("Arbiter worker booting...");

    let engine_config = EngineConfig::from_env();

    // Language profiles: built-ins, optional file, env limit overrides
    let mut registry = LanguageRegistry::builtin();
    if let Some(path) = &engine_config.languages_file {
        let added = registry.merge_file(path).map_err(|e| {
            error!("Failed to load language profiles: {:#}", e);
            e
        })?;
        info!(path = %path.display(), added, "Merged language profiles");
    }
    registry.apply_limit_overrides(process_env);
    info!("Loaded language profiles for: {:?}", registry.list_languages());
    let registry = Arc::new(registry);

    // Sandbox backend and availability gate
    let sandbox = Arc::new(
        DockerSandbox::connect(&engine_config.sandbox).context("Failed to configure Docker client")?,
    );
    let backend: Arc<dyn SandboxBackend> = sandbox.clone();
    let gate = Arc::new(AvailabilityGate::new(backend.clone(), engine_config.health_ttl()));

    if gate.refresh().await {
        sandbox.prepare_images(&registry.profiles()).await;
    } else {
        warn!("Docker is unavailable at startup; submissions will be rejected until it recovers");
    }
    let monitor = gate.spawn_monitor(engine_config.health_check_interval());

    // Connect to Redis. BLPOP blocks its connection, so each loop gets its own.
    let client = ::redis::Client::open(worker_config.redis_url.as_str())
        .context("Invalid REDIS_URL")?;
    let intake_conn = redis_connection(&client).await?;
    let cancel_conn = redis_connection(&client).await?;
    let sink_conn = redis_connection(&client).await?;
    info!("Connected to Redis: {}", worker_config.redis_url);

    let executor = TestCaseExecutor::new(
        backend,
        registry.clone(),
        engine_config.sandbox.compile_memory_mb,
    )
    .with_case_bounds(engine_config.sandbox.case_bounds());
    let sink = Arc::new(RedisResultSink::new(sink_conn, worker_config.result_ttl_secs));
    let queue = SubmissionQueue::start(executor, gate.clone(), sink, QueueConfig::from(&engine_config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let intake = tokio::spawn(intake::intake_loop(
        intake_conn,
        queue.clone(),
        worker_config.result_ttl_secs,
        worker_config.poll_timeout_secs,
        shutdown_rx.clone(),
    ));
    let cancels = tokio::spawn(intake::cancel_loop(
        cancel_conn,
        queue.clone(),
        worker_config.poll_timeout_secs,
        shutdown_rx.clone(),
    ));

    let state = Arc::new(server::AppState {
        gate: gate.clone(),
        queue: queue.clone(),
    });
    let server = tokio::spawn(server::serve(worker_config.metrics_port, state, shutdown_rx));

    info!(
        pool_size = engine_config.worker_pool_size,
        metrics_port = worker_config.metrics_port,
        "Ready to accept submissions"
    );

    // Setup graceful shutdown
    signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    warn!("Received shutdown signal, draining queue...");

    let _ = shutdown_tx.send(true);
    let _ = intake.await;
    let _ = cancels.await;

    queue.close().await;
    let drained = queue
        .drain(Duration::from_secs(worker_config.drain_timeout_secs))
        .await;
    if !drained {
        warn!("Shutting down with jobs still in flight");
    }

    monitor.abort();
    match server.await {
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Worker shutdown complete");
    Ok(())
}
