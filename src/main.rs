use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use judge_worker::cancel::CancelToken;
use judge_worker::config::WorkerConfig;
use judge_worker::languages::LanguageRegistry;
use judge_worker::queue::RedisQueue;
use judge_worker::runner::SandboxedRunner;
use judge_worker::store::RedisStore;
use judge_worker::WorkerContext;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("judge_worker=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = Arc::new(WorkerConfig::from_env()?);

    let registry = match &config.languages_path {
        Some(path) => {
            let registry = LanguageRegistry::load(path)?;
            info!("Loaded language configurations from {}", path.display());
            registry
        }
        None => {
            let registry = LanguageRegistry::bundled()?;
            info!("Loaded bundled language configurations");
            registry
        }
    };
    info!(
        "Supported languages: {}",
        registry.supported_languages().join(", ")
    );
    let registry = Arc::new(registry);

    std::fs::create_dir_all(&config.scratch_root).with_context(|| {
        format!(
            "Failed to create scratch root {}",
            config.scratch_root.display()
        )
    })?;

    info!("Starting Judge Worker...");

    let client = redis::Client::open(config.redis_url.clone())?;
    let runner = Arc::new(SandboxedRunner::new(config.sandbox.clone()));
    let shutdown = CancelToken::new();
    let abort = CancelToken::new();
    tokio::spawn(watch_signals(shutdown.clone(), abort.clone()));

    let mut handles = Vec::with_capacity(config.worker_count);
    for id in 0..config.worker_count {
        let conn = get_redis_connection(&client, &shutdown).await?;
        let Some(conn) = conn else { break };

        let queue = RedisQueue::new(conn.clone(), config.visibility_timeout, config.request_timeout);
        let store = RedisStore::new(conn, config.request_timeout);
        let ctx = WorkerContext::new(
            id,
            Arc::new(queue),
            Arc::new(store),
            runner.clone(),
            registry.clone(),
            config.clone(),
        )
        .with_shutdown(shutdown.clone(), abort.clone());
        handles.push(tokio::spawn(ctx.run()));
    }
    info!(
        "Connected to Redis at {}, {} worker(s) running",
        config.redis_url,
        handles.len()
    );

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker task failed: {}", e);
        }
    }

    info!("Judge Worker stopped");
    Ok(())
}

/// First SIGINT/SIGTERM stops dequeuing and lets running jobs finish; a second
/// one cancels them too.
async fn watch_signals(shutdown: CancelToken, abort: CancelToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            return;
        }
    };

    let mut received = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        received += 1;
        if received == 1 {
            info!("Shutdown requested, waiting for in-flight jobs to finish...");
            shutdown.cancel();
        } else {
            warn!("Second shutdown signal, cancelling in-flight jobs");
            abort.cancel();
            return;
        }
    }
}

/// Connect, retrying until Redis is reachable. `None` when shut down first.
async fn get_redis_connection(
    client: &redis::Client,
    shutdown: &CancelToken,
) -> Result<Option<ConnectionManager>> {
    loop {
        let attempt = tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            attempt = ConnectionManager::new(client.clone()) => attempt,
        };
        match attempt {
            Ok(conn) => return Ok(Some(conn)),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(None),
                    _ = sleep(Duration::from_secs(3)) => {}
                }
            }
        }
    }
}
