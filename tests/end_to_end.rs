//! Broader, multi-component scenarios that cross module boundaries:
//! gateway admission, status-manager writes, and the dual-store read path
//! working together the way a gateway process and a worker process would
//! see them, without standing up a real broker or database.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;

use task_substrate::broker::Broker;
use task_substrate::domain::{
    TaskEnvelope, TaskRecord, TaskRequest, TaskState, TaskUpdate, WorkerStatus, WorkerStatusRecord,
};
use task_substrate::error::SubstrateError;
use task_substrate::gateway::quota::{GovernorQuota, NoOpQuota};
use task_substrate::gateway::{GatewayService, Principal};
use task_substrate::config::GatewayConfig;
use task_substrate::status_manager::StatusManager;
use task_substrate::storage::{DurableStore, TaskStore, WorkerStore};
use task_substrate::Result;

#[derive(Default)]
struct SharedFastStore {
    records: StdMutex<HashMap<String, TaskRecord>>,
}

#[async_trait]
impl TaskStore for SharedFastStore {
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

/// A fast store whose `update_task` fails exactly once, then recovers,
/// modelling a transient flap.
#[derive(Default)]
struct FlappingFastStore {
    inner: SharedFastStore,
    fail_next_update: StdMutex<bool>,
}

#[async_trait]
impl TaskStore for FlappingFastStore {
    async fn create_task(&self, record: &TaskRecord) -> Result<()> {
        self.inner.create_task(record).await
    }
    async fn get_task(&self, correlation_id: &str) -> Result<Option<TaskRecord>> {
        self.inner.get_task(correlation_id).await
    }
    async fn update_task(&self, correlation_id: &str, partial: &TaskUpdate) -> Result<()> {
        let mut fail = self.fail_next_update.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(SubstrateError::FastStoreUnavailable("flap".into()));
        }
        drop(fail);
        self.inner.update_task(correlation_id, partial).await
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
        self.inner.delete_task(correlation_id).await
    }
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.inner.list_tasks().await
    }
}

#[derive(Default)]
struct SharedDurableStore {
    records: StdMutex<HashMap<String, TaskRecord>>,
}

#[async_trait]
impl DurableStore for SharedDurableStore {
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

struct StaticWorkerStore {
    count: usize,
}

#[async_trait]
impl WorkerStore for StaticWorkerStore {
    async fn publish_worker_status(&self, _worker_id: &str, _status: &WorkerStatus) -> Result<()> {
        Ok(())
    }
    async fn publish_worker_status_resilient(
        &self,
        _worker_id: &str,
        _status: &WorkerStatus,
        _max_wait: Duration,
    ) -> Result<bool> {
        Ok(true)
    }
    async fn get_worker_count(&self) -> Result<usize> {
        Ok(self.count)
    }
    async fn get_active_workers(&self) -> Result<Vec<WorkerStatusRecord>> {
        Ok(Vec::new())
    }
}

struct ReadyBroker;

#[async_trait]
impl Broker for ReadyBroker {
    async fn is_ready(&self) -> bool {
        true
    }
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
    async fn publish_task(&self, _envelope: &TaskEnvelope) -> Result<()> {
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
        max_mandate_length: 500,
        max_ticks_limit: 50,
        cors_allowed_origins: vec![],
        trusted_hosts: vec![],
        disable_quota_checks: true,
    }
}

/// Drives a submitted task through the same sequence of status writes the
/// worker lifecycle issues, without needing a live broker connection.
async fn run_task_to_completion(
    status_manager: &StatusManager,
    correlation_id: &str,
    result_notes: &str,
) {
    status_manager
        .publish_task_status(
            correlation_id,
            TaskUpdate {
                status: Some(TaskState::Accepted),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap();
    status_manager
        .publish_task_status(
            correlation_id,
            TaskUpdate {
                status: Some(TaskState::InProgress),
                tick: Some(1),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap();
    status_manager
        .publish_task_status(
            correlation_id,
            TaskUpdate {
                status: Some(TaskState::Completed),
                result: Some(task_substrate::domain::CompletionResult {
                    success: true,
                    deliverables: vec!["report.md".into()],
                    notes: result_notes.into(),
                }),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn happy_path_submit_work_then_read_back_completed_result() {
    let fast_store = std::sync::Arc::new(SharedFastStore::default());
    let durable_store = std::sync::Arc::new(SharedDurableStore::default());
    let gateway = GatewayService::new(
        test_config(),
        fast_store.clone(),
        durable_store.clone(),
        std::sync::Arc::new(StaticWorkerStore { count: 1 }),
        std::sync::Arc::new(ReadyBroker),
        std::sync::Arc::new(NoOpQuota),
    );

    let principal = Principal {
        user_id: "alice".into(),
        access_token: "alice-token".into(),
    };
    let accepted = gateway
        .create_task(
            TaskRequest {
                mandate: "draft a release summary".into(),
                max_ticks: Some(5),
                correlation_id: Some("task-1".into()),
            },
            &principal,
        )
        .await
        .unwrap();
    assert_eq!(accepted.status, "in_queue");

    let status_manager = StatusManager::new(
        fast_store.clone(),
        std::sync::Arc::new(StaticWorkerStore { count: 1 }),
        Duration::from_secs(1),
        Duration::from_secs(5),
    );
    run_task_to_completion(&status_manager, "task-1", "release summary ready").await;

    let response = gateway.get_task("task-1", Some(&principal)).await.unwrap();
    assert_eq!(response.status, "completed");
    assert_eq!(response.result.unwrap().notes, "release summary ready");
}

#[tokio::test]
async fn cleanup_on_terminal_read_removes_fast_store_copy_but_keeps_durable_history() {
    let fast_store = std::sync::Arc::new(SharedFastStore::default());
    let durable_store = std::sync::Arc::new(SharedDurableStore::default());
    let gateway = GatewayService::new(
        test_config(),
        fast_store.clone(),
        durable_store.clone(),
        std::sync::Arc::new(StaticWorkerStore { count: 1 }),
        std::sync::Arc::new(ReadyBroker),
        std::sync::Arc::new(NoOpQuota),
    );

    let principal = Principal {
        user_id: "bob".into(),
        access_token: "bob-token".into(),
    };
    gateway
        .create_task(
            TaskRequest {
                mandate: "summarize the quarterly numbers".into(),
                max_ticks: Some(3),
                correlation_id: Some("task-2".into()),
            },
            &principal,
        )
        .await
        .unwrap();

    let status_manager = StatusManager::new(
        fast_store.clone(),
        std::sync::Arc::new(StaticWorkerStore { count: 1 }),
        Duration::from_secs(1),
        Duration::from_secs(5),
    );
    run_task_to_completion(&status_manager, "task-2", "numbers summarized").await;

    assert!(fast_store.get_task("task-2").await.unwrap().is_some());

    let first_read = gateway.get_task("task-2", Some(&principal)).await.unwrap();
    assert_eq!(first_read.status, "completed");

    // Terminal read syncs forward then purges the fast-store copy.
    assert!(fast_store.get_task("task-2").await.unwrap().is_none());
    assert!(durable_store
        .get_task("task-2", "bob", "bob-token")
        .await
        .unwrap()
        .is_some());

    // A later read with no fast-store entry falls back to the durable copy.
    let second_read = gateway.get_task("task-2", Some(&principal)).await.unwrap();
    assert_eq!(second_read.status, "completed");
}

#[tokio::test]
async fn unauthenticated_terminal_read_purges_fast_store_without_a_durable_principal() {
    let fast_store = std::sync::Arc::new(SharedFastStore::default());
    let durable_store = std::sync::Arc::new(SharedDurableStore::default());
    let gateway = GatewayService::new(
        test_config(),
        fast_store.clone(),
        durable_store.clone(),
        std::sync::Arc::new(StaticWorkerStore { count: 1 }),
        std::sync::Arc::new(ReadyBroker),
        std::sync::Arc::new(NoOpQuota),
    );

    let principal = Principal {
        user_id: "carol".into(),
        access_token: "carol-token".into(),
    };
    gateway
        .create_task(
            TaskRequest {
                mandate: "triage inbound tickets".into(),
                max_ticks: Some(2),
                correlation_id: Some("task-3".into()),
            },
            &principal,
        )
        .await
        .unwrap();

    let status_manager = StatusManager::new(
        fast_store.clone(),
        std::sync::Arc::new(StaticWorkerStore { count: 1 }),
        Duration::from_secs(1),
        Duration::from_secs(5),
    );
    status_manager
        .publish_task_status(
            "task-3",
            TaskUpdate {
                status: Some(TaskState::Failed),
                error: Some("ran out of ticks".into()),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap();

    // No principal: the read still resolves from the fast store and still
    // purges it, but never reaches the durable store.
    let response = gateway.get_task("task-3", None).await.unwrap();
    assert_eq!(response.status, "failed");
    assert!(fast_store.get_task("task-3").await.unwrap().is_none());
    assert!(durable_store
        .get_task("task-3", "carol", "carol-token")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn quota_exhaustion_blocks_submission_before_any_store_write() {
    let fast_store = std::sync::Arc::new(SharedFastStore::default());
    let durable_store = std::sync::Arc::new(SharedDurableStore::default());
    let gateway = GatewayService::new(
        test_config(),
        fast_store.clone(),
        durable_store,
        std::sync::Arc::new(StaticWorkerStore { count: 1 }),
        std::sync::Arc::new(ReadyBroker),
        std::sync::Arc::new(GovernorQuota::new(1)),
    );

    let principal = Principal {
        user_id: "dave".into(),
        access_token: "dave-token".into(),
    };

    gateway
        .create_task(
            TaskRequest {
                mandate: "first mandate".into(),
                max_ticks: Some(1),
                correlation_id: Some("task-4a".into()),
            },
            &principal,
        )
        .await
        .unwrap();

    let second = gateway
        .create_task(
            TaskRequest {
                mandate: "second mandate, same day".into(),
                max_ticks: Some(1),
                correlation_id: Some("task-4b".into()),
            },
            &principal,
        )
        .await;

    assert!(matches!(second, Err(SubstrateError::QuotaExceeded { .. })));
    assert!(fast_store.get_task("task-4b").await.unwrap().is_none());
}

#[tokio::test]
async fn resilient_status_write_survives_a_transient_fast_store_flap() {
    let fast_store = std::sync::Arc::new(FlappingFastStore::default());
    fast_store
        .create_task(&TaskRecord::new(
            "task-5".into(),
            Some("erin".into()),
            "recover from a flap".into(),
            4,
        ))
        .await
        .unwrap();

    *fast_store.fail_next_update.lock().unwrap() = true;

    let status_manager = StatusManager::new(
        fast_store.clone(),
        std::sync::Arc::new(StaticWorkerStore { count: 1 }),
        Duration::from_millis(20),
        Duration::from_secs(5),
    );

    // The first write fails (flap), lands in the pending buffer...
    status_manager
        .publish_task_status(
            "task-5",
            TaskUpdate {
                status: Some(TaskState::InProgress),
                tick: Some(2),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap();
    assert!(status_manager.has_pending_updates().await);

    // ...and the retry loop drains it once the store recovers.
    status_manager.retry_pending_updates().await;
    assert!(!status_manager.has_pending_updates().await);

    let record = fast_store.get_task("task-5").await.unwrap().unwrap();
    assert_eq!(record.status, TaskState::InProgress);
    assert_eq!(record.tick, Some(2));
}
