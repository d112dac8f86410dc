use std::sync::Arc;

use anyhow::Result;
use task_substrate::api::ApiServer;
use task_substrate::auth::{AuthState, StaticKeyValidator, TokenValidator};
use task_substrate::broker::AmqpBroker;
use task_substrate::config::Config;
use task_substrate::gateway::GatewayService;
use task_substrate::gateway::quota::{GovernorQuota, NoOpQuota, QuotaChecker};
use task_substrate::monitoring::SystemMonitor;
use task_substrate::rate_limit::RateLimitState;
use task_substrate::storage::durable::RestDurableStore;
use task_substrate::storage::fast::RedisStore;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("starting gateway");

    let config = Config::load()?;

    let fast_store = Arc::new(
        RedisStore::connect(
            &config.fast_store.redis_url,
            std::time::Duration::from_secs(config.status.heartbeat_interval_seconds),
        )
        .await?,
    );
    let durable_store = Arc::new(RestDurableStore::new(config.durable_store.base_url.clone()));
    let broker = Arc::new(
        AmqpBroker::connect(&config.broker.amqp_url, config.broker.task_queue_name.clone()).await,
    );

    let quota: Arc<dyn QuotaChecker> = if config.gateway.disable_quota_checks {
        Arc::new(NoOpQuota)
    } else {
        Arc::new(GovernorQuota::new(
            std::env::var("GATEWAY_DAILY_MANDATE_QUOTA")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),
        ))
    };

    let monitor = Arc::new(SystemMonitor::new(
        broker.clone(),
        vec![broker.circuit_breaker(), fast_store.circuit_breaker()],
    ));

    let gateway = Arc::new(GatewayService::new(
        config.gateway.clone(),
        fast_store.clone(),
        durable_store,
        fast_store.clone(),
        broker,
        quota,
    ));

    let api_server = ApiServer::new(config.gateway.clone(), gateway, monitor)?;

    let validator: Arc<dyn TokenValidator> = Arc::new(StaticKeyValidator {
        api_key: std::env::var("GATEWAY_API_KEY").unwrap_or_default(),
        user_id: std::env::var("GATEWAY_DEFAULT_USER_ID").unwrap_or_else(|_| "default".into()),
    });
    let auth_state = AuthState::new(validator);
    let rate_limit_state = RateLimitState::default();

    let app = api_server.build_router(auth_state, rate_limit_state);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

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
