//! Redis-backed fast store. Keys: `task:{correlation_id}`, `worker:{worker_id}`.
//! Worker keys carry a liveness TTL refreshed by the presence heartbeat.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::constants::{FAST_STORE_CREATE_RETRY_BACKOFF_SECS, WORKER_PRESENCE_TTL_FACTOR};
use crate::domain::{TaskRecord, TaskUpdate, WorkerStatus, WorkerStatusRecord};
use crate::error::SubstrateError;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};
use crate::Result;

use super::{TaskStore, WorkerStore};

const TASK_KEY_PREFIX: &str = "task:";
const WORKER_KEY_PREFIX: &str = "worker:";

pub struct RedisStore {
    conn: ConnectionManager,
    heartbeat_interval: Duration,
    circuit: Arc<CircuitBreaker>,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, heartbeat_interval: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
        Ok(Self {
            conn,
            heartbeat_interval,
            circuit: Arc::new(CircuitBreaker::new(
                "fast_store",
                CircuitBreakerConfig::recovery(Duration::from_secs(30)),
            )),
        })
    }

    /// The circuit breaker guarding Redis calls, exposed for health
    /// reporting.
    pub fn circuit_breaker(&self) -> Arc<CircuitBreaker> {
        self.circuit.clone()
    }

    fn task_key(correlation_id: &str) -> String {
        format!("{TASK_KEY_PREFIX}{correlation_id}")
    }

    fn worker_key(worker_id: &str) -> String {
        format!("{WORKER_KEY_PREFIX}{worker_id}")
    }

    async fn read_back(&self, correlation_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::task_key(correlation_id))
            .await
            .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
        Ok(raw.is_some())
    }

    /// Runs `op` through the circuit breaker, mapping an open circuit to
    /// `FastStoreUnavailable` rather than attempting the call.
    async fn guarded<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match self.circuit.call(op).await {
            Some(result) => result,
            None => Err(SubstrateError::FastStoreUnavailable(
                "fast-store circuit open".into(),
            )),
        }
    }
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn create_task(&self, record: &TaskRecord) -> Result<()> {
        self.guarded(|| async {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let mut conn = self.conn.clone();
                let payload = serde_json::to_string(record)?;
                let write_result: std::result::Result<(), redis::RedisError> = conn
                    .set(Self::task_key(&record.correlation_id), payload)
                    .await;

                let verified = write_result.is_ok()
                    && self.read_back(&record.correlation_id).await.unwrap_or(false);

                if verified {
                    return Ok(());
                }

                if attempt >= crate::constants::FAST_STORE_CREATE_MAX_RETRIES {
                    return Err(SubstrateError::FastStoreUnavailable(format!(
                        "failed to durably create task {} after {attempt} attempts",
                        record.correlation_id
                    )));
                }

                let backoff = FAST_STORE_CREATE_RETRY_BACKOFF_SECS * attempt as f64;
                warn!(
                    correlation_id = %record.correlation_id,
                    attempt,
                    "fast store create failed readback, retrying in {backoff}s"
                );
                sleep(Duration::from_secs_f64(backoff)).await;
            }
        })
        .await
    }

    async fn get_task(&self, correlation_id: &str) -> Result<Option<TaskRecord>> {
        self.guarded(|| async {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn
                .get(Self::task_key(correlation_id))
                .await
                .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
            match raw {
                Some(s) => Ok(Some(serde_json::from_str(&s)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn update_task(&self, correlation_id: &str, partial: &TaskUpdate) -> Result<()> {
        self.guarded(|| async {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn
                .get(Self::task_key(correlation_id))
                .await
                .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
            let Some(raw) = raw else {
                return Err(SubstrateError::NotFound(format!(
                    "task {correlation_id} not found in fast store"
                )));
            };
            let mut record: TaskRecord = serde_json::from_str(&raw)?;
            record.apply(partial);
            let payload = serde_json::to_string(&record)?;
            conn.set::<_, _, ()>(Self::task_key(correlation_id), payload)
                .await
                .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn update_task_resilient(
        &self,
        correlation_id: &str,
        partial: &TaskUpdate,
        max_wait: Duration,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut attempt = 0u32;
        loop {
            match self.update_task(correlation_id, partial).await {
                Ok(()) => return Ok(true),
                Err(err) => {
                    attempt += 1;
                    if tokio::time::Instant::now() >= deadline {
                        debug!(correlation_id, attempt, %err, "resilient update exhausted budget");
                        return Ok(false);
                    }
                    let backoff = Duration::from_secs_f64(
                        (FAST_STORE_CREATE_RETRY_BACKOFF_SECS * attempt as f64).min(2.0),
                    );
                    sleep(backoff.min(deadline.saturating_duration_since(tokio::time::Instant::now())))
                        .await;
                }
            }
        }
    }

    async fn delete_task(&self, correlation_id: &str) -> Result<bool> {
        self.guarded(|| async {
            let mut conn = self.conn.clone();
            let deleted: i64 = conn
                .del(Self::task_key(correlation_id))
                .await
                .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.guarded(|| async {
            let mut conn = self.conn.clone();
            let keys: Vec<String> = conn
                .keys(format!("{TASK_KEY_PREFIX}*"))
                .await
                .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let values: Vec<Option<String>> = conn
                .mget(&keys)
                .await
                .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
            Ok(values
                .into_iter()
                .flatten()
                .filter_map(|v| serde_json::from_str(&v).ok())
                .collect())
        })
        .await
    }
}

#[async_trait]
impl WorkerStore for RedisStore {
    async fn publish_worker_status(&self, worker_id: &str, status: &WorkerStatus) -> Result<()> {
        self.guarded(|| async {
            let mut conn = self.conn.clone();
            let record = WorkerStatusRecord {
                worker_id: worker_id.to_string(),
                status: status.clone(),
                updated_at: chrono::Utc::now(),
            };
            let payload = serde_json::to_string(&record)?;
            let ttl = self.heartbeat_interval.as_secs() * WORKER_PRESENCE_TTL_FACTOR as u64;
            conn.set_ex::<_, _, ()>(Self::worker_key(worker_id), payload, ttl)
                .await
                .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn publish_worker_status_resilient(
        &self,
        worker_id: &str,
        status: &WorkerStatus,
        max_wait: Duration,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut attempt = 0u32;
        loop {
            match self.publish_worker_status(worker_id, status).await {
                Ok(()) => return Ok(true),
                Err(_) => {
                    attempt += 1;
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(false);
                    }
                    sleep(Duration::from_secs_f64(
                        FAST_STORE_CREATE_RETRY_BACKOFF_SECS * attempt as f64,
                    ))
                    .await;
                }
            }
        }
    }

    async fn get_worker_count(&self) -> Result<usize> {
        self.guarded(|| async {
            let mut conn = self.conn.clone();
            let keys: Vec<String> = conn
                .keys(format!("{WORKER_KEY_PREFIX}*"))
                .await
                .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
            Ok(keys.len())
        })
        .await
    }

    async fn get_active_workers(&self) -> Result<Vec<WorkerStatusRecord>> {
        self.guarded(|| async {
            let mut conn = self.conn.clone();
            let keys: Vec<String> = conn
                .keys(format!("{WORKER_KEY_PREFIX}*"))
                .await
                .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let values: Vec<Option<String>> = conn
                .mget(&keys)
                .await
                .map_err(|e| SubstrateError::FastStoreUnavailable(e.to_string()))?;
            Ok(values
                .into_iter()
                .flatten()
                .filter_map(|v| serde_json::from_str(&v).ok())
                .collect())
        })
        .await
    }
}
