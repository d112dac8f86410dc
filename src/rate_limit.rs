//! IP-based request-rate limiting. Distinct from the per-user daily mandate
//! quota in [`crate::gateway::quota`]: this guards the gateway itself from
//! abusive request volume regardless of which user a request claims to be.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::Mutex;
use tracing::warn;

pub const REQUESTS_PER_MINUTE: u32 = 60;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone)]
pub struct RateLimitState {
    per_minute: u32,
    limiters: Arc<Mutex<HashMap<IpAddr, Arc<DirectRateLimiter>>>>,
}

impl RateLimitState {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            limiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn limiter_for(&self, ip: IpAddr) -> Arc<DirectRateLimiter> {
        let mut limiters = self.limiters.lock().await;
        limiters
            .entry(ip)
            .or_insert_with(|| {
                let quota = Quota::per_minute(
                    NonZeroU32::new(self.per_minute).unwrap_or(NonZeroU32::new(1).unwrap()),
                );
                Arc::new(RateLimiter::direct(quota))
            })
            .clone()
    }
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new(REQUESTS_PER_MINUTE)
    }
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));

    let limiter = state.limiter_for(ip).await;
    if limiter.check().is_err() {
        warn!(%ip, path = request.uri().path(), "rate limit exceeded");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_requests_within_quota() {
        let state = RateLimitState::new(60);
        let limiter = state.limiter_for(IpAddr::from([127, 0, 0, 1])).await;
        assert!(limiter.check().is_ok());
    }

    #[tokio::test]
    async fn limiter_is_reused_per_ip() {
        let state = RateLimitState::new(60);
        let ip = IpAddr::from([127, 0, 0, 1]);
        let first = state.limiter_for(ip).await;
        let second = state.limiter_for(ip).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn denies_requests_once_quota_exhausted() {
        let state = RateLimitState::new(1);
        let limiter = state.limiter_for(IpAddr::from([127, 0, 0, 1])).await;
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }
}
