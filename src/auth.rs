//! Token validation itself is an external capability (an identity provider,
//! a session service) that this substrate does not implement. This module
//! only defines the seam: a middleware that extracts a bearer token, hands
//! it to an injected [`TokenValidator`], and stamps the resolved user id
//! onto the request for downstream handlers to read.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::warn;

#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns the resolved user id on success, `None` on an invalid token.
    async fn validate(&self, token: &str) -> Option<String>;
}

/// Validates against a single shared key, stamping a fixed user id. Useful
/// for local runs and tests; production deployments inject a validator that
/// talks to the real identity provider.
pub struct StaticKeyValidator {
    pub api_key: String,
    pub user_id: String,
}

#[async_trait]
impl TokenValidator for StaticKeyValidator {
    async fn validate(&self, token: &str) -> Option<String> {
        if token.as_bytes().ct_eq(self.api_key.as_bytes()).into() {
            Some(self.user_id.clone())
        } else {
            None
        }
    }
}

#[derive(Clone)]
pub struct AuthState {
    pub validator: Arc<dyn TokenValidator>,
}

impl AuthState {
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self { validator }
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"}))).into_response()
}

pub async fn auth_middleware(
    State(auth_state): State<AuthState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // CORS preflight requests carry no credentials and must succeed for the
    // browser to proceed with the real request.
    if method == Method::OPTIONS {
        return Ok(next.run(request).await);
    }
    if path == "/health" {
        return Ok(next.run(request).await);
    }

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        warn!(path, "missing or malformed authorization header");
        return Err(unauthorized());
    };

    match auth_state.validator.validate(token).await {
        Some(user_id) => {
            if let Ok(value) = HeaderValue::from_str(&user_id) {
                request.headers_mut().insert("x-user-id", value);
            }
            Ok(next.run(request).await)
        }
        None => {
            warn!(path, "token validation failed");
            Err(unauthorized())
        }
    }
}
