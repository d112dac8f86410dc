use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_duration: Duration,
    pub success_threshold: u32,
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_duration: Duration::from_secs(60),
            success_threshold: 3,
            failure_window: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery(recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: 5,
            timeout_duration: recovery_timeout,
            ..Default::default()
        }
    }
}

/// Generic circuit breaker wrapping any fallible async operation: broker
/// connect/publish, fast-store reads/writes.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitState>>,
    failure_count: Arc<AtomicU32>,
    success_count: Arc<AtomicU32>,
    last_failure_time: Arc<RwLock<Option<Instant>>>,
    last_state_change: Arc<RwLock<Instant>>,
    total_requests: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_count: Arc::new(AtomicU32::new(0)),
            success_count: Arc::new(AtomicU32::new(0)),
            last_failure_time: Arc::new(RwLock::new(None)),
            last_state_change: Arc::new(RwLock::new(Instant::now())),
            total_requests: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Runs `op` if the circuit allows it, recording the outcome. Returns
    /// `None` without calling `op` when the circuit is open.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Option<std::result::Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if !self.should_allow_request().await {
            return None;
        }
        match op().await {
            Ok(value) => {
                self.record_success().await;
                Some(Ok(value))
            }
            Err(err) => {
                self.record_failure().await;
                Some(Err(err))
            }
        }
    }

    pub async fn should_allow_request(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let current_state = *self.state.read().await;

        match current_state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let last_change = *self.last_state_change.read().await;
                if last_change.elapsed() >= self.config.timeout_duration {
                    self.transition_to_half_open().await;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub async fn record_success(&self) {
        let current_state = *self.state.read().await;

        match current_state {
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    breaker = %self.name,
                    "circuit breaker success count: {}/{}",
                    count, self.config.success_threshold
                );
                if count >= self.config.success_threshold {
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {
                warn!(breaker = %self.name, "success recorded while circuit is open");
            }
        }
    }

    pub async fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let current_state = *self.state.read().await;

        match current_state {
            CircuitState::Closed => {
                let mut last_failure = self.last_failure_time.write().await;
                let now = Instant::now();

                if let Some(last_time) = *last_failure {
                    if now.duration_since(last_time) > self.config.failure_window {
                        self.failure_count.store(1, Ordering::Relaxed);
                    } else {
                        let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(
                            breaker = %self.name,
                            "circuit breaker failure count: {}/{}",
                            count, self.config.failure_threshold
                        );
                        if count >= self.config.failure_threshold {
                            self.transition_to_open().await;
                        }
                    }
                } else {
                    self.failure_count.store(1, Ordering::Relaxed);
                }

                *last_failure = Some(now);
            }
            CircuitState::HalfOpen => {
                self.transition_to_open().await;
            }
            CircuitState::Open => {
                let mut last_failure = self.last_failure_time.write().await;
                *last_failure = Some(Instant::now());
            }
        }
    }

    async fn transition_to_open(&self) {
        let mut state = self.state.write().await;
        let previous_state = *state;
        *state = CircuitState::Open;

        let mut last_change = self.last_state_change.write().await;
        *last_change = Instant::now();

        self.success_count.store(0, Ordering::Relaxed);

        warn!(
            breaker = %self.name,
            "circuit breaker opened (was {:?}); total_requests={} total_failures={}",
            previous_state,
            self.total_requests.load(Ordering::Relaxed),
            self.total_failures.load(Ordering::Relaxed)
        );
    }

    async fn transition_to_half_open(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::HalfOpen;

        let mut last_change = self.last_state_change.write().await;
        *last_change = Instant::now();

        self.success_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);

        info!(breaker = %self.name, "circuit breaker transitioned to half-open");
    }

    async fn transition_to_closed(&self) {
        let mut state = self.state.write().await;
        let previous_state = *state;
        *state = CircuitState::Closed;

        let mut last_change = self.last_state_change.write().await;
        *last_change = Instant::now();

        self.failure_count.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);

        info!(breaker = %self.name, "circuit breaker closed (was {:?})", previous_state);
    }

    pub async fn get_state(&self) -> CircuitState {
        *self.state.read().await
    }

    pub async fn get_metrics(&self) -> CircuitBreakerMetrics {
        let last_change = *self.last_state_change.read().await;
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: *self.state.read().await,
            failure_count: self.failure_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            last_state_change_seconds: last_change.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub last_state_change_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        );
        assert!(breaker.should_allow_request().await);
        breaker.record_failure().await;
        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.get_state().await, CircuitState::Open);
        assert!(!breaker.should_allow_request().await);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout_duration: Duration::from_millis(10),
                success_threshold: 2,
                ..Default::default()
            },
        );
        breaker.record_failure().await;
        assert_eq!(breaker.get_state().await, CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.should_allow_request().await);
        assert_eq!(breaker.get_state().await, CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.get_state().await, CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn call_short_circuits_when_open() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        let result: Option<std::result::Result<(), &str>> =
            breaker.call(|| async { Err("boom") }).await;
        assert!(result.is_some());
        assert_eq!(breaker.get_state().await, CircuitState::Open);

        let second: Option<std::result::Result<(), &str>> =
            breaker.call(|| async { Ok(()) }).await;
        assert!(second.is_none());
    }
}
