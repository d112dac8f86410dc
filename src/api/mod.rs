use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::middleware::Next;
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::auth::{auth_middleware, AuthState};
use crate::config::GatewayConfig;
use crate::domain::{TaskRequest, TaskResponse};
use crate::error::SubstrateError;
use crate::gateway::{GatewayService, Principal};
use crate::monitoring::{SystemMonitor, SystemStatus};
use crate::rate_limit::{rate_limit_middleware, RateLimitState};
use crate::validation::MandateValidator;

const ROUTE_HEALTH: &str = "/health";
const ROUTE_SYSTEM_STATUS: &str = "/system/status";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASK_BY_ID: &str = "/tasks/{task_id}";
const ROUTE_AGENT_COUNT: &str = "/agents/count";

const SERVICE_NAME: &str = "task-substrate";

#[derive(Clone)]
pub struct ApiServer {
    config: GatewayConfig,
    gateway: Arc<GatewayService>,
    validator: Arc<MandateValidator>,
    monitor: Arc<SystemMonitor>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentCountResponse {
    pub count: u32,
}

type HandlerResult<T> = std::result::Result<T, (StatusCode, Json<ErrorResponse>)>;

fn to_handler_error(err: SubstrateError) -> (StatusCode, Json<ErrorResponse>) {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(%err, "unhandled gateway error");
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            details: None,
        }),
    )
}

/// Extracts the authenticated principal the gateway operates on behalf of.
/// Token *validation* is an external capability; here we only read the
/// already-validated identity carried by upstream middleware.
fn principal_from_headers(headers: &axum::http::HeaderMap) -> HandlerResult<Principal> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| to_handler_error(SubstrateError::Unauthorized))?;
    let access_token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").to_string())
        .ok_or_else(|| to_handler_error(SubstrateError::Unauthorized))?;
    Ok(Principal {
        user_id,
        access_token,
    })
}

impl ApiServer {
    pub fn new(
        config: GatewayConfig,
        gateway: Arc<GatewayService>,
        monitor: Arc<SystemMonitor>,
    ) -> crate::Result<Self> {
        let validator = Arc::new(MandateValidator::new()?);
        Ok(Self {
            config,
            gateway,
            validator,
            monitor,
        })
    }

    /// Middleware layering order: trusted host -> rate limit -> auth -> trace -> timeout -> CORS.
    pub fn build_router(&self, auth_state: AuthState, rate_limit_state: RateLimitState) -> Router {
        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .cors_allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-user-id"),
            ])
            .max_age(std::time::Duration::from_secs(3600));

        Router::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_SYSTEM_STATUS, get(system_status))
            .route(ROUTE_TASKS, post(create_task).get(list_tasks))
            .route(ROUTE_TASK_BY_ID, get(get_task_status))
            .route(ROUTE_AGENT_COUNT, get(agent_count))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(
                        self.clone(),
                        trusted_host_middleware,
                    ))
                    .layer(middleware::from_fn_with_state(
                        rate_limit_state,
                        rate_limit_middleware,
                    ))
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(std::time::Duration::from_secs(
                        self.config.request_timeout_seconds,
                    )))
                    .layer(cors_layer),
            )
            .layer(axum::extract::DefaultBodyLimit::max(
                self.config.max_request_size_bytes,
            ))
            .with_state(self.clone())
    }
}

/// Rejects requests whose `Host` header isn't in the configured allowlist.
/// An empty `trusted_hosts` list disables the filter entirely.
async fn trusted_host_middleware(
    State(api): State<ApiServer>,
    request: Request,
    next: Next,
) -> HandlerResult<Response> {
    if api.config.trusted_hosts.is_empty() {
        return Ok(next.run(request).await);
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.rsplit_once(':').map_or(h, |(host, _)| host).to_string());

    match host {
        Some(host) if api.config.trusted_hosts.iter().any(|allowed| allowed == &host) => {
            Ok(next.run(request).await)
        }
        _ => Err(to_handler_error(SubstrateError::Forbidden(
            "host not in trusted_hosts allowlist".into(),
        ))),
    }
}

async fn health_check(State(api): State<ApiServer>) -> Json<serde_json::Value> {
    let agent_count = api.gateway.agent_count().await;
    let snapshot = api.monitor.snapshot(agent_count).await;
    Json(serde_json::json!({
        "status": snapshot.status,
        "service": SERVICE_NAME,
        "components": {
            "broker": snapshot.broker,
            "circuit_breakers": snapshot.circuit_breakers,
            "workers": snapshot.worker_count,
        },
        "uptime_seconds": snapshot.uptime_seconds,
    }))
}

async fn system_status(State(api): State<ApiServer>) -> Json<SystemStatus> {
    let agent_count = api.gateway.agent_count().await;
    Json(api.monitor.snapshot(agent_count).await)
}

async fn create_task(
    State(api): State<ApiServer>,
    headers: axum::http::HeaderMap,
    Json(request): Json<TaskRequest>,
) -> HandlerResult<(StatusCode, Json<TaskResponse>)> {
    let principal = principal_from_headers(&headers)?;

    api.validator
        .validate(&request.mandate, api.config.max_mandate_length)
        .map_err(|e| to_handler_error(SubstrateError::Validation(e)))?;

    let response = api
        .gateway
        .create_task(request, &principal)
        .await
        .map_err(to_handler_error)?;

    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn get_task_status(
    State(api): State<ApiServer>,
    headers: axum::http::HeaderMap,
    Path(task_id): Path<String>,
) -> HandlerResult<Json<TaskResponse>> {
    let principal = principal_from_headers(&headers).ok();
    let response = api
        .gateway
        .get_task(&task_id, principal.as_ref())
        .await
        .map_err(to_handler_error)?;
    Ok(Json(response))
}

async fn list_tasks(
    State(api): State<ApiServer>,
    headers: axum::http::HeaderMap,
) -> HandlerResult<Json<Vec<TaskResponse>>> {
    let principal = principal_from_headers(&headers)?;
    let response = api
        .gateway
        .list_tasks(&principal)
        .await
        .map_err(to_handler_error)?;
    Ok(Json(response))
}

async fn agent_count(State(api): State<ApiServer>) -> Json<AgentCountResponse> {
    Json(AgentCountResponse {
        count: api.gateway.agent_count().await,
    })
}
