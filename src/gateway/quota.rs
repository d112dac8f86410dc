//! Per-user admission quota. A `NoOp` implementation is selected when
//! quota checks are disabled by configuration.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u32,
}

#[async_trait]
pub trait QuotaChecker: Send + Sync {
    async fn check_and_consume(&self, user_id: &str, units: u32) -> QuotaDecision;
}

/// Permitted-infinite quota, used when `DISABLE_QUOTA_CHECKS=true`.
pub struct NoOpQuota;

#[async_trait]
impl QuotaChecker for NoOpQuota {
    async fn check_and_consume(&self, _user_id: &str, _units: u32) -> QuotaDecision {
        QuotaDecision {
            allowed: true,
            remaining: u32::MAX,
        }
    }
}

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

struct UserQuota {
    limiter: Arc<DirectRateLimiter>,
    consumed: u32,
}

/// Per-user daily token bucket built on `governor`. `remaining` reflects
/// cumulative consumption across calls, not just the current one.
pub struct GovernorQuota {
    daily_allowance: u32,
    limiters: Mutex<HashMap<String, UserQuota>>,
}

impl GovernorQuota {
    pub fn new(daily_allowance: u32) -> Self {
        Self {
            daily_allowance,
            limiters: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl QuotaChecker for GovernorQuota {
    async fn check_and_consume(&self, user_id: &str, units: u32) -> QuotaDecision {
        let mut limiters = self.limiters.lock().await;
        let entry = limiters.entry(user_id.to_string()).or_insert_with(|| {
            let quota = Quota::with_period(std::time::Duration::from_secs(86400))
                .unwrap()
                .allow_burst(NonZeroU32::new(self.daily_allowance.max(1)).unwrap());
            UserQuota {
                limiter: Arc::new(RateLimiter::direct(quota)),
                consumed: 0,
            }
        });

        match NonZeroU32::new(units.max(1)) {
            Some(n) => match entry.limiter.check_n(n) {
                Ok(_) => {
                    entry.consumed = entry.consumed.saturating_add(units);
                    QuotaDecision {
                        allowed: true,
                        remaining: self.daily_allowance.saturating_sub(entry.consumed),
                    }
                }
                Err(_) => QuotaDecision {
                    allowed: false,
                    remaining: self.daily_allowance.saturating_sub(entry.consumed),
                },
            },
            None => QuotaDecision {
                allowed: true,
                remaining: self.daily_allowance.saturating_sub(entry.consumed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_quota_always_allows() {
        let quota = NoOpQuota;
        let decision = quota.check_and_consume("user-1", 1000).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn governor_quota_denies_when_exhausted() {
        let quota = GovernorQuota::new(5);
        let first = quota.check_and_consume("user-1", 5).await;
        assert!(first.allowed);
        let second = quota.check_and_consume("user-1", 1).await;
        assert!(!second.allowed);
    }
}
