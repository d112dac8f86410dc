pub mod durable;
pub mod fast;

use async_trait::async_trait;

use crate::domain::{TaskRecord, TaskUpdate, WorkerStatus, WorkerStatusRecord};
use crate::Result;

/// The fast, low-latency, TTL-agnostic task store. Holds a record for
/// every non-terminal task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, record: &TaskRecord) -> Result<()>;
    async fn get_task(&self, correlation_id: &str) -> Result<Option<TaskRecord>>;
    async fn update_task(&self, correlation_id: &str, partial: &TaskUpdate) -> Result<()>;
    /// Retries the update within `max_wait` before giving up, returning
    /// `false` (not an error) on exhaustion so callers can buffer it.
    async fn update_task_resilient(
        &self,
        correlation_id: &str,
        partial: &TaskUpdate,
        max_wait: std::time::Duration,
    ) -> Result<bool>;
    async fn delete_task(&self, correlation_id: &str) -> Result<bool>;
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>>;
}

/// Worker presence/availability, backed by the same fast store.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn publish_worker_status(&self, worker_id: &str, status: &WorkerStatus) -> Result<()>;
    async fn publish_worker_status_resilient(
        &self,
        worker_id: &str,
        status: &WorkerStatus,
        max_wait: std::time::Duration,
    ) -> Result<bool>;
    async fn get_worker_count(&self) -> Result<usize>;
    /// Every worker currently holding a live presence key, with its last
    /// published status.
    async fn get_active_workers(&self) -> Result<Vec<WorkerStatusRecord>>;
}

/// The authoritative, row-scoped, per-user store.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn create_task(
        &self,
        record: &TaskRecord,
        user_id: &str,
        access_token: &str,
    ) -> Result<()>;
    async fn get_task(
        &self,
        correlation_id: &str,
        user_id: &str,
        access_token: &str,
    ) -> Result<Option<TaskRecord>>;
    async fn update_task(
        &self,
        correlation_id: &str,
        partial: &TaskUpdate,
        user_id: &str,
        access_token: &str,
    ) -> Result<()>;
    async fn list_tasks(&self, user_id: &str, access_token: &str) -> Result<Vec<TaskRecord>>;
}
