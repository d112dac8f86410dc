use thiserror::Error;

/// Convenience alias for Results across the substrate.
pub type Result<T> = std::result::Result<T, SubstrateError>;

/// Error taxonomy for the task-lifecycle and worker-coordination substrate.
///
/// Variants map to the abstract kinds the gateway and worker distinguish:
/// validation, authorization/quota, transient-dependency, permanent-
/// dependency, agent-execution, and protocol errors.
#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },

    #[error("Fast store unavailable: {0}")]
    FastStoreUnavailable(String),

    #[error("Durable store unavailable: {0}")]
    DurableStoreUnavailable(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Task execution error: {correlation_id} - {message}")]
    TaskExecution {
        correlation_id: String,
        message: String,
    },

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SubstrateError {
    /// Maps an error kind to the HTTP status code the gateway returns.
    pub fn status_code(&self) -> u16 {
        match self {
            SubstrateError::Validation(_) | SubstrateError::ConfigurationError(_) => 400,
            SubstrateError::Unauthorized => 401,
            SubstrateError::Forbidden(_) => 403,
            SubstrateError::NotFound(_) => 404,
            SubstrateError::QuotaExceeded { .. } => 429,
            SubstrateError::Timeout { .. } => 504,
            _ => 500,
        }
    }
}
