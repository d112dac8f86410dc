pub mod quota;

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::GatewayConfig;
use crate::domain::{TaskRecord, TaskRequest, TaskResponse, TaskState};
use crate::error::SubstrateError;
use crate::storage::{DurableStore, TaskStore, WorkerStore};
use crate::Result;

use quota::QuotaChecker;

/// Authenticated caller identity. Token validation itself is an external
/// capability; the gateway only carries the already-authenticated
/// principal and the access token used to scope durable-store rows.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub access_token: String,
}

pub struct GatewayService {
    config: GatewayConfig,
    fast_store: Arc<dyn TaskStore>,
    durable_store: Arc<dyn DurableStore>,
    worker_store: Arc<dyn WorkerStore>,
    broker: Arc<dyn Broker>,
    quota: Arc<dyn QuotaChecker>,
}

impl GatewayService {
    pub fn new(
        config: GatewayConfig,
        fast_store: Arc<dyn TaskStore>,
        durable_store: Arc<dyn DurableStore>,
        worker_store: Arc<dyn WorkerStore>,
        broker: Arc<dyn Broker>,
        quota: Arc<dyn QuotaChecker>,
    ) -> Self {
        Self {
            config,
            fast_store,
            durable_store,
            worker_store,
            broker,
            quota,
        }
    }

    pub async fn create_task(
        &self,
        request: TaskRequest,
        principal: &Principal,
    ) -> Result<TaskResponse> {
        if request.mandate.len() > self.config.max_mandate_length {
            return Err(SubstrateError::Validation(format!(
                "mandate exceeds max length of {} characters",
                self.config.max_mandate_length
            )));
        }

        let max_ticks = request
            .max_ticks
            .unwrap_or(crate::constants::DEFAULT_SUBMISSION_MAX_TICKS);
        if max_ticks > self.config.max_ticks_limit {
            return Err(SubstrateError::Validation(format!(
                "max_ticks exceeds limit of {}",
                self.config.max_ticks_limit
            )));
        }

        let decision = self
            .quota
            .check_and_consume(&principal.user_id, max_ticks)
            .await;
        if !decision.allowed {
            return Err(SubstrateError::QuotaExceeded {
                message: format!("daily allowance exhausted for user {}", principal.user_id),
            });
        }

        let correlation_id = request
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let record = TaskRecord::new(
            correlation_id.clone(),
            Some(principal.user_id.clone()),
            request.mandate.clone(),
            max_ticks,
        );

        // Fast-store create is required; failure aborts the submission.
        self.fast_store.create_task(&record).await.map_err(|e| {
            SubstrateError::FastStoreUnavailable(format!(
                "could not create task {correlation_id}: {e}"
            ))
        })?;

        // Durable-store create is best-effort; the fast store is
        // authoritative for in-flight work.
        if let Err(err) = self
            .durable_store
            .create_task(&record, &principal.user_id, &principal.access_token)
            .await
        {
            warn!(correlation_id, %err, "durable-store create failed, continuing");
        }

        let envelope = crate::domain::TaskEnvelope {
            correlation_id: correlation_id.clone(),
            mandate: request.mandate,
            max_ticks,
        };

        if !self.broker.is_ready().await {
            if let Err(err) = self.broker.reconnect().await {
                return Err(SubstrateError::BrokerUnavailable(format!(
                    "broker reconnect failed for task {correlation_id}: {err}"
                )));
            }
        }

        self.broker.publish_task(&envelope).await.map_err(|e| {
            SubstrateError::BrokerUnavailable(format!(
                "failed to enqueue task {correlation_id}: {e}"
            ))
        })?;

        debug!(correlation_id, "task created and enqueued");
        Ok(record.into())
    }

    pub async fn get_task(
        &self,
        correlation_id: &str,
        principal: Option<&Principal>,
    ) -> Result<TaskResponse> {
        let fast = self.fast_store.get_task(correlation_id).await.ok().flatten();

        let durable = match principal {
            Some(p) => self
                .durable_store
                .get_task(correlation_id, &p.user_id, &p.access_token)
                .await
                .ok()
                .flatten(),
            None => None,
        };

        let is_completed_in_fast = fast
            .as_ref()
            .map(|r| r.status.is_terminal())
            .unwrap_or(false);

        let chosen = match (&fast, &durable, principal) {
            (Some(fast_record), _, Some(p)) => {
                let should_sync = match &durable {
                    None => true,
                    Some(durable_record) => match fast_record.updated_at.cmp(&durable_record.updated_at) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        // Tie on updated_at: prefer terminal > in_progress > accepted > pending.
                        std::cmp::Ordering::Equal => fast_record.status > durable_record.status,
                    },
                };

                if should_sync {
                    let partial = crate::domain::TaskUpdate {
                        status: Some(fast_record.status),
                        mandate: Some(fast_record.mandate.clone()),
                        tick: fast_record.tick,
                        max_ticks: Some(fast_record.max_ticks),
                        result: fast_record.result.clone(),
                        error: fast_record.error.clone(),
                    };
                    let synced = match &durable {
                        Some(_) => {
                            self.durable_store
                                .update_task(correlation_id, &partial, &p.user_id, &p.access_token)
                                .await
                        }
                        None => {
                            self.durable_store
                                .create_task(fast_record, &p.user_id, &p.access_token)
                                .await
                        }
                    };

                    match synced {
                        Ok(()) => {
                            if is_completed_in_fast {
                                if let Err(err) = self.fast_store.delete_task(correlation_id).await {
                                    warn!(correlation_id, %err, "cleanup delete failed");
                                } else {
                                    info!(correlation_id, "terminal task synced and removed from fast store");
                                }
                            }
                            fast_record.clone()
                        }
                        Err(err) => {
                            warn!(correlation_id, %err, "sync-forward to durable store failed");
                            fast_record.clone()
                        }
                    }
                } else {
                    durable
                        .clone()
                        .unwrap_or_else(|| fast_record.clone())
                }
            }
            (Some(fast_record), _, None) => {
                if is_completed_in_fast {
                    if let Err(err) = self.fast_store.delete_task(correlation_id).await {
                        warn!(correlation_id, %err, "unauthenticated cleanup delete failed");
                    }
                }
                fast_record.clone()
            }
            (None, Some(durable_record), _) => durable_record.clone(),
            (None, None, _) => {
                return Err(SubstrateError::NotFound(format!(
                    "task {correlation_id} not found"
                )))
            }
        };

        Ok(chosen.into())
    }

    /// Reads exclusively from the durable store, row-scoped to the caller.
    pub async fn list_tasks(&self, principal: &Principal) -> Result<Vec<TaskResponse>> {
        let records = self
            .durable_store
            .list_tasks(&principal.user_id, &principal.access_token)
            .await?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    pub async fn agent_count(&self) -> u32 {
        self.worker_store
            .get_worker_count()
            .await
            .map(|n| n as u32)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskUpdate, WorkerStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct InMemoryFastStore {
        records: StdMutex<HashMap<String, TaskRecord>>,
    }

    #[async_trait]
    impl TaskStore for InMemoryFastStore {
        async fn create_task(&self, record: &TaskRecord) -> Result<()> {
            self.records
                .lock()
                .unwrap()
                .insert(record.correlation_id.clone(), record.clone());
            Ok(())
        }
        async fn get_task(&self, correlation_id: &str) -> Result<Option<TaskRecord>> {
            Ok(self.records.lock().unwrap().get(correlation_id).cloned())
        }
        async fn update_task(&self, correlation_id: &str, partial: &TaskUpdate) -> Result<()> {
            let mut records = self.records.lock().unwrap();
            let record = records
                .get_mut(correlation_id)
                .ok_or_else(|| SubstrateError::NotFound(correlation_id.to_string()))?;
            record.apply(partial);
            Ok(())
        }
        async fn update_task_resilient(
            &self,
            correlation_id: &str,
            partial: &TaskUpdate,
            _max_wait: Duration,
        ) -> Result<bool> {
            Ok(self.update_task(correlation_id, partial).await.is_ok())
        }
        async fn delete_task(&self, correlation_id: &str) -> Result<bool> {
            Ok(self.records.lock().unwrap().remove(correlation_id).is_some())
        }
        async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
            Ok(self.records.lock().unwrap().values().cloned().collect())
        }
    }

    struct NoopWorkerStore;
    #[async_trait]
    impl WorkerStore for NoopWorkerStore {
        async fn publish_worker_status(&self, _: &str, _: &WorkerStatus) -> Result<()> {
            Ok(())
        }
        async fn publish_worker_status_resilient(
            &self,
            _: &str,
            _: &WorkerStatus,
            _: Duration,
        ) -> Result<bool> {
            Ok(true)
        }
        async fn get_worker_count(&self) -> Result<usize> {
            Ok(2)
        }
        async fn get_active_workers(&self) -> Result<Vec<crate::domain::WorkerStatusRecord>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct InMemoryDurableStore {
        records: StdMutex<HashMap<String, TaskRecord>>,
    }

    #[async_trait]
    impl DurableStore for InMemoryDurableStore {
        async fn create_task(&self, record: &TaskRecord, _user_id: &str, _token: &str) -> Result<()> {
            self.records
                .lock()
                .unwrap()
                .insert(record.correlation_id.clone(), record.clone());
            Ok(())
        }
        async fn get_task(
            &self,
            correlation_id: &str,
            _user_id: &str,
            _token: &str,
        ) -> Result<Option<TaskRecord>> {
            Ok(self.records.lock().unwrap().get(correlation_id).cloned())
        }
        async fn update_task(
            &self,
            correlation_id: &str,
            partial: &TaskUpdate,
            _user_id: &str,
            _token: &str,
        ) -> Result<()> {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(correlation_id) {
                record.apply(partial);
            }
            Ok(())
        }
        async fn list_tasks(&self, _user_id: &str, _token: &str) -> Result<Vec<TaskRecord>> {
            Ok(self.records.lock().unwrap().values().cloned().collect())
        }
    }

    struct AlwaysReadyBroker;
    #[async_trait]
    impl Broker for AlwaysReadyBroker {
        async fn is_ready(&self) -> bool {
            true
        }
        async fn reconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn publish_task(&self, _envelope: &crate::domain::TaskEnvelope) -> Result<()> {
            Ok(())
        }
        async fn queue_depth(&self) -> Result<u32> {
            Ok(0)
        }
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            host: "127.0.0.1".into(),
            port: 0,
            request_timeout_seconds: 30,
            max_request_size_bytes: 1024,
            max_mandate_length: 100,
            max_ticks_limit: 10,
            cors_allowed_origins: vec![],
            trusted_hosts: vec![],
            disable_quota_checks: true,
        }
    }

    fn build_service() -> GatewayService {
        GatewayService::new(
            test_config(),
            Arc::new(InMemoryFastStore::default()),
            Arc::new(InMemoryDurableStore::default()),
            Arc::new(NoopWorkerStore),
            Arc::new(AlwaysReadyBroker),
            Arc::new(quota::NoOpQuota),
        )
    }

    #[tokio::test]
    async fn create_task_rejects_oversized_mandate() {
        let service = build_service();
        let principal = Principal {
            user_id: "u1".into(),
            access_token: "tok".into(),
        };
        let request = TaskRequest {
            mandate: "x".repeat(200),
            max_ticks: None,
            correlation_id: None,
        };
        let result = service.create_task(request, &principal).await;
        assert!(matches!(result, Err(SubstrateError::Validation(_))));
    }

    #[tokio::test]
    async fn create_task_then_get_task_round_trips() {
        let service = build_service();
        let principal = Principal {
            user_id: "u1".into(),
            access_token: "tok".into(),
        };
        let request = TaskRequest {
            mandate: "say hello".into(),
            max_ticks: Some(3),
            correlation_id: Some("c-1".into()),
        };
        let response = service.create_task(request, &principal).await.unwrap();
        assert_eq!(response.status, "in_queue");

        let fetched = service.get_task("c-1", Some(&principal)).await.unwrap();
        assert_eq!(fetched.correlation_id, "c-1");
    }

    #[tokio::test]
    async fn get_task_not_found_returns_error() {
        let service = build_service();
        let principal = Principal {
            user_id: "u1".into(),
            access_token: "tok".into(),
        };
        let result = service.get_task("missing", Some(&principal)).await;
        assert!(matches!(result, Err(SubstrateError::NotFound(_))));
    }

    #[tokio::test]
    async fn agent_count_reflects_worker_store() {
        let service = build_service();
        assert_eq!(service.agent_count().await, 2);
    }
}
