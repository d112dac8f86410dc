use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use task_substrate::broker::AmqpBroker;
use task_substrate::config::Config;
use task_substrate::status_manager::StatusManager;
use task_substrate::storage::fast::RedisStore;
use task_substrate::worker::agent_engine::{AgentEngine, ScriptedAgentEngine};
use task_substrate::worker::protection::{NoOpProtection, TaskProtection};
use task_substrate::worker::WorkerLifecycle;
use tracing::{info, Level};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4()));
    info!(%worker_id, "starting worker");

    let config = Config::load()?;

    let fast_store = Arc::new(
        RedisStore::connect(
            &config.fast_store.redis_url,
            Duration::from_secs(config.status.heartbeat_interval_seconds),
        )
        .await?,
    );
    let broker = Arc::new(
        AmqpBroker::connect(&config.broker.amqp_url, config.broker.task_queue_name.clone()).await,
    );

    let status_manager = Arc::new(StatusManager::new(
        fast_store.clone(),
        fast_store.clone(),
        Duration::from_secs(config.status.resilient_max_wait_seconds),
        Duration::from_secs(config.status.resilient_retry_timeout_seconds),
    ));

    // The reasoning engine itself is an external capability; this scripted
    // engine is a local stand-in until a real one is wired in by the
    // deployment.
    let engine: Arc<dyn AgentEngine> = Arc::new(ScriptedAgentEngine::success(Vec::new()));
    let protection: Arc<dyn TaskProtection> = Arc::new(NoOpProtection);

    let lifecycle = Arc::new(WorkerLifecycle::new(
        worker_id,
        config.worker.clone(),
        config.status.clone(),
        broker,
        fast_store.clone(),
        fast_store,
        status_manager,
        engine,
        protection,
    ));

    let run_handle = {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { lifecycle.start().await })
    };

    shutdown_signal().await;
    lifecycle.stop().await;
    run_handle.await.ok();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
