//! Single authority for task- and worker-status writes from the worker
//! side. Two write modes — best-effort and resilient — both funnel into
//! the same pending-update buffer on failure; a background retry loop
//! drains it under a snapshot-then-drain pattern (lock only for the
//! buffer swap, I/O happens outside the lock).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::constants::MAX_PENDING_STATUS_UPDATES;
use crate::domain::{TaskState, TaskUpdate, WorkerStatus};
use crate::storage::{TaskStore, WorkerStore};
use crate::Result;

struct PendingTaskUpdate {
    correlation_id: String,
    update: TaskUpdate,
    enqueued_at: Instant,
}

struct PendingWorkerUpdate {
    worker_id: String,
    status: WorkerStatus,
    enqueued_at: Instant,
}

struct Buffers {
    task_updates: Vec<PendingTaskUpdate>,
    worker_update: Option<PendingWorkerUpdate>,
}

pub struct StatusManager {
    task_store: Arc<dyn TaskStore>,
    worker_store: Arc<dyn WorkerStore>,
    resilient_max_wait: Duration,
    resilient_retry_timeout: Duration,
    buffers: Mutex<Buffers>,
}

impl StatusManager {
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        worker_store: Arc<dyn WorkerStore>,
        resilient_max_wait: Duration,
        resilient_retry_timeout: Duration,
    ) -> Self {
        Self {
            task_store,
            worker_store,
            resilient_max_wait,
            resilient_retry_timeout,
            buffers: Mutex::new(Buffers {
                task_updates: Vec::new(),
                worker_update: None,
            }),
        }
    }

    /// Publishes a task status update. `resilient=true` retries under a
    /// per-call budget before buffering; `resilient=false` makes one
    /// attempt and buffers on any failure.
    pub async fn publish_task_status(
        &self,
        correlation_id: &str,
        update: TaskUpdate,
        resilient: bool,
    ) -> Result<()> {
        let succeeded = if resilient {
            self.task_store
                .update_task_resilient(correlation_id, &update, self.resilient_max_wait)
                .await
                .unwrap_or(false)
        } else {
            self.task_store
                .update_task(correlation_id, &update)
                .await
                .is_ok()
        };

        if !succeeded {
            self.buffer_task_update(correlation_id, update).await;
        }
        Ok(())
    }

    pub async fn publish_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        resilient: bool,
    ) -> Result<()> {
        let succeeded = if resilient {
            self.worker_store
                .publish_worker_status_resilient(worker_id, &status, self.resilient_max_wait)
                .await
                .unwrap_or(false)
        } else {
            self.worker_store
                .publish_worker_status(worker_id, &status)
                .await
                .is_ok()
        };

        if !succeeded {
            self.buffer_worker_update(worker_id, status).await;
        }
        Ok(())
    }

    async fn buffer_task_update(&self, correlation_id: &str, update: TaskUpdate) {
        let mut buffers = self.buffers.lock().await;
        if buffers.task_updates.len() >= MAX_PENDING_STATUS_UPDATES {
            warn!(correlation_id, "pending status buffer full, dropping update");
            return;
        }
        buffers.task_updates.push(PendingTaskUpdate {
            correlation_id: correlation_id.to_string(),
            update,
            enqueued_at: Instant::now(),
        });
    }

    async fn buffer_worker_update(&self, worker_id: &str, status: WorkerStatus) {
        let mut buffers = self.buffers.lock().await;
        buffers.worker_update = Some(PendingWorkerUpdate {
            worker_id: worker_id.to_string(),
            status,
            enqueued_at: Instant::now(),
        });
    }

    pub async fn has_pending_updates(&self) -> bool {
        let buffers = self.buffers.lock().await;
        !buffers.task_updates.is_empty() || buffers.worker_update.is_some()
    }

    pub async fn pending_count(&self) -> usize {
        let buffers = self.buffers.lock().await;
        buffers.task_updates.len() + buffers.worker_update.is_some() as usize
    }

    /// Drains both buffers once. Snapshot under the lock, retry I/O
    /// outside it, then reacquire to install whatever remains.
    pub async fn retry_pending_updates(&self) {
        let (task_updates, worker_update) = {
            let mut buffers = self.buffers.lock().await;
            (
                std::mem::take(&mut buffers.task_updates),
                buffers.worker_update.take(),
            )
        };

        let mut remaining_tasks = Vec::new();
        for pending in task_updates {
            let elapsed = pending.enqueued_at.elapsed();
            if elapsed >= self.resilient_retry_timeout {
                warn!(
                    correlation_id = %pending.correlation_id,
                    "giving up on status update after {}s",
                    elapsed.as_secs()
                );
                continue;
            }

            let remaining_budget = self.resilient_retry_timeout - elapsed;
            let max_wait = remaining_budget.min(self.resilient_max_wait);
            let ok = self
                .task_store
                .update_task_resilient(&pending.correlation_id, &pending.update, max_wait)
                .await
                .unwrap_or(false);

            if ok {
                continue;
            }

            let elapsed_after = pending.enqueued_at.elapsed();
            if elapsed_after >= self.resilient_retry_timeout {
                warn!(
                    correlation_id = %pending.correlation_id,
                    "giving up on status update after {}s",
                    elapsed_after.as_secs()
                );
                continue;
            }

            if elapsed_after.as_secs() % 60 == 0 {
                info!(
                    correlation_id = %pending.correlation_id,
                    "still retrying status update after {}s",
                    elapsed_after.as_secs()
                );
            }
            remaining_tasks.push(pending);
        }

        let remaining_worker = match worker_update {
            Some(pending) => {
                let elapsed = pending.enqueued_at.elapsed();
                if elapsed >= self.resilient_retry_timeout {
                    warn!(
                        worker_id = %pending.worker_id,
                        "giving up on worker status update after {}s",
                        elapsed.as_secs()
                    );
                    None
                } else {
                    let remaining_budget = self.resilient_retry_timeout - elapsed;
                    let max_wait = remaining_budget.min(self.resilient_max_wait);
                    let ok = self
                        .worker_store
                        .publish_worker_status_resilient(&pending.worker_id, &pending.status, max_wait)
                        .await
                        .unwrap_or(false);
                    if ok {
                        None
                    } else {
                        Some(pending)
                    }
                }
            }
            None => None,
        };

        let mut buffers = self.buffers.lock().await;
        buffers.task_updates = remaining_tasks;
        buffers.worker_update = remaining_worker;
    }
}

/// Builds a sparse `TaskUpdate` for a status transition, mirroring the
/// gateway's normalization table at the domain layer.
pub fn status_update(state: TaskState) -> TaskUpdate {
    TaskUpdate {
        status: Some(state),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskRecord;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FlakyTaskStore {
        fail_next: StdMutex<bool>,
        last: StdMutex<Option<TaskRecord>>,
    }

    #[async_trait]
    impl TaskStore for FlakyTaskStore {
        async fn create_task(&self, record: &TaskRecord) -> Result<()> {
            *self.last.lock().unwrap() = Some(record.clone());
            Ok(())
        }
        async fn get_task(&self, _correlation_id: &str) -> Result<Option<TaskRecord>> {
            Ok(self.last.lock().unwrap().clone())
        }
        async fn update_task(&self, _correlation_id: &str, partial: &TaskUpdate) -> Result<()> {
            let mut fail = self.fail_next.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(crate::error::SubstrateError::FastStoreUnavailable("flaky".into()));
            }
            let mut last = self.last.lock().unwrap();
            if let Some(record) = last.as_mut() {
                record.apply(partial);
            }
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
        async fn delete_task(&self, _correlation_id: &str) -> Result<bool> {
            Ok(true)
        }
        async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
            Ok(self.last.lock().unwrap().clone().into_iter().collect())
        }
    }

    struct NoopWorkerStore;
    #[async_trait]
    impl WorkerStore for NoopWorkerStore {
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
            Ok(0)
        }
        async fn get_active_workers(&self) -> Result<Vec<crate::domain::WorkerStatusRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn best_effort_failure_buffers_and_retry_drains() {
        let store = Arc::new(FlakyTaskStore::default());
        store
            .create_task(&TaskRecord::new("c1".into(), None, "do it".into(), 10))
            .await
            .unwrap();
        *store.fail_next.lock().unwrap() = true;

        let manager = StatusManager::new(
            store.clone(),
            Arc::new(NoopWorkerStore),
            Duration::from_millis(50),
            Duration::from_secs(60),
        );

        manager
            .publish_task_status("c1", status_update(TaskState::InProgress), false)
            .await
            .unwrap();
        assert!(manager.has_pending_updates().await);

        manager.retry_pending_updates().await;
        assert!(!manager.has_pending_updates().await);
    }

    #[tokio::test]
    async fn stale_pending_update_is_dropped_after_timeout() {
        let store = Arc::new(FlakyTaskStore::default());
        let manager = StatusManager::new(
            store.clone(),
            Arc::new(NoopWorkerStore),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        manager
            .buffer_task_update("c2", status_update(TaskState::Failed))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.retry_pending_updates().await;
        assert!(!manager.has_pending_updates().await);
    }
}
