use std::env;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::error::SubstrateError;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub status: StatusConfig,
    pub broker: BrokerConfig,
    pub fast_store: FastStoreConfig,
    pub durable_store: DurableStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
    pub max_request_size_bytes: usize,
    pub max_mandate_length: usize,
    pub max_ticks_limit: u32,
    pub cors_allowed_origins: Vec<String>,
    pub trusted_hosts: Vec<String>,
    pub disable_quota_checks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub free_timeout_seconds: u64,
    pub task_timeout_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    pub shutdown_timeout_seconds: u64,
    pub max_mandate_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    pub heartbeat_interval_seconds: u64,
    pub resilient_max_wait_seconds: u64,
    pub resilient_retry_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub amqp_url: String,
    pub task_queue_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastStoreConfig {
    pub redis_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableStoreConfig {
    pub base_url: String,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let amqp_url = env::var("BROKER_AMQP_URL").map_err(|_| {
            SubstrateError::ConfigurationError(
                "BROKER_AMQP_URL environment variable is required".to_string(),
            )
        })?;

        let redis_url = env::var("FAST_STORE_REDIS_URL").map_err(|_| {
            SubstrateError::ConfigurationError(
                "FAST_STORE_REDIS_URL environment variable is required".to_string(),
            )
        })?;

        let durable_base_url = env::var("DURABLE_STORE_BASE_URL").map_err(|_| {
            SubstrateError::ConfigurationError(
                "DURABLE_STORE_BASE_URL environment variable is required".to_string(),
            )
        })?;

        let cors_allowed_origins = env_or("CORS_ALLOWED_ORIGINS", "http://localhost:3000")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let trusted_hosts = env_or("TRUSTED_HOSTS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let gateway = GatewayConfig {
            host: env_or("API_HOST", "127.0.0.1"),
            port: env_parse("API_PORT", 3000),
            request_timeout_seconds: env_parse("GATEWAY_REQUEST_TIMEOUT_SECONDS", 300),
            max_request_size_bytes: env_parse("GATEWAY_MAX_REQUEST_SIZE_BYTES", 10 * 1024 * 1024),
            max_mandate_length: env_parse(
                "GATEWAY_MAX_MANDATE_LENGTH",
                crate::constants::DEFAULT_MAX_MANDATE_LENGTH,
            ),
            max_ticks_limit: env_parse(
                "GATEWAY_MAX_TICKS_LIMIT",
                crate::constants::DEFAULT_MAX_TICKS,
            ),
            cors_allowed_origins,
            trusted_hosts,
            disable_quota_checks: env_parse("DISABLE_QUOTA_CHECKS", false),
        };

        let worker = WorkerConfig {
            free_timeout_seconds: env_parse("AGENT_FREE_TIMEOUT_SECONDS", 300),
            task_timeout_seconds: env_parse("AGENT_TASK_TIMEOUT_SECONDS", 1800),
            heartbeat_timeout_seconds: env_parse("AGENT_HEARTBEAT_TIMEOUT_SECONDS", 10),
            shutdown_timeout_seconds: env_parse("AGENT_SHUTDOWN_TIMEOUT_SECONDS", 30),
            max_mandate_length: env_parse(
                "GATEWAY_MAX_MANDATE_LENGTH",
                crate::constants::DEFAULT_MAX_MANDATE_LENGTH,
            ),
        };

        let status = StatusConfig {
            heartbeat_interval_seconds: env_parse("STATUS_TIME", 15),
            resilient_max_wait_seconds: env_parse("RESILIENT_STATUS_MAX_WAIT_SECONDS", 10),
            resilient_retry_timeout_seconds: env_parse(
                "RESILIENT_STATUS_RETRY_TIMEOUT_SECONDS",
                300,
            ),
        };

        let broker = BrokerConfig {
            amqp_url,
            task_queue_name: env_or("BROKER_TASK_QUEUE_NAME", "tasks"),
        };

        let fast_store = FastStoreConfig {
            redis_url,
        };

        let durable_store = DurableStoreConfig {
            base_url: durable_base_url,
        };

        Ok(Config {
            gateway,
            worker,
            status,
            broker,
            fast_store,
            durable_store,
        })
    }
}
