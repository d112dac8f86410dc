pub mod agent_engine;
pub mod presence;
pub mod protection;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::broker::{AmqpBroker, Broker, Delivery};
use crate::config::{StatusConfig, WorkerConfig};
use crate::constants::{
    FREE_TIMEOUT_CHECK_INTERVAL_SECS, RECONNECT_BACKOFF_BASE_SECS, RECONNECT_BACKOFF_CAP_SECS,
    RECONNECT_BACKOFF_MULTIPLIER, SHUTDOWN_TASK_CANCEL_TIMEOUT_SECS,
};
use crate::domain::{TaskState, TaskUpdate, WorkerStatus};
use crate::status_manager::StatusManager;
use crate::storage::{TaskStore, WorkerStore};

use agent_engine::{AgentEngine, TickReporter};
use presence::PresenceHandle;
use protection::TaskProtection;

/// Drives a single worker process from startup through an unbounded
/// sequence of task executions to graceful drain.
pub struct WorkerLifecycle {
    worker_id: String,
    worker_config: WorkerConfig,
    status_config: StatusConfig,
    broker: Arc<AmqpBroker>,
    fast_store: Arc<dyn TaskStore>,
    worker_store: Arc<dyn WorkerStore>,
    status_manager: Arc<StatusManager>,
    engine: Arc<dyn AgentEngine>,
    protection: Arc<dyn TaskProtection>,
    current_status: Arc<RwLock<WorkerStatus>>,
    should_exit: Arc<AtomicBool>,
    presence: RwLock<Option<PresenceHandle>>,
    consumer_running: Arc<AtomicBool>,
    consumer_handle: Mutex<Option<JoinHandle<()>>>,
    active_heartbeat: Mutex<Option<JoinHandle<()>>>,
    status_retry_handle: Mutex<Option<JoinHandle<()>>>,
    reconnect_handle: Mutex<Option<JoinHandle<()>>>,
    free_timeout_handle: Mutex<Option<JoinHandle<()>>>,
    free_since: RwLock<Option<tokio::time::Instant>>,
}

impl WorkerLifecycle {
    pub fn new(
        worker_id: String,
        worker_config: WorkerConfig,
        status_config: StatusConfig,
        broker: Arc<AmqpBroker>,
        fast_store: Arc<dyn TaskStore>,
        worker_store: Arc<dyn WorkerStore>,
        status_manager: Arc<StatusManager>,
        engine: Arc<dyn AgentEngine>,
        protection: Arc<dyn TaskProtection>,
    ) -> Self {
        Self {
            worker_id,
            worker_config,
            status_config,
            broker,
            fast_store,
            worker_store,
            status_manager,
            engine,
            protection,
            current_status: Arc::new(RwLock::new(WorkerStatus::Free)),
            should_exit: Arc::new(AtomicBool::new(false)),
            presence: RwLock::new(None),
            consumer_running: Arc::new(AtomicBool::new(false)),
            consumer_handle: Mutex::new(None),
            active_heartbeat: Mutex::new(None),
            status_retry_handle: Mutex::new(None),
            reconnect_handle: Mutex::new(None),
            free_timeout_handle: Mutex::new(None),
            free_since: RwLock::new(None),
        }
    }

    /// Runs the worker until `stop()` is called from another task, driving
    /// the consumer loop, presence heartbeat, status-retry loop,
    /// reconnect loop, and free-timeout loop concurrently.
    pub async fn start(self: Arc<Self>) {
        let presence = presence::spawn(
            self.worker_id.clone(),
            self.worker_store(),
            Duration::from_secs(self.status_config.heartbeat_interval_seconds),
            self.current_status.clone(),
        );
        *self.presence.write().await = Some(presence);

        self.status_manager
            .publish_worker_status(&self.worker_id, WorkerStatus::Free, false)
            .await
            .ok();
        *self.free_since.write().await = Some(tokio::time::Instant::now());

        let status_retry_handle = {
            let manager = self.status_manager.clone();
            let should_exit = self.should_exit.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    crate::constants::STATUS_RETRY_LOOP_INTERVAL_SECS,
                ));
                while !should_exit.load(Ordering::Relaxed) {
                    ticker.tick().await;
                    manager.retry_pending_updates().await;
                }
            })
        };
        *self.status_retry_handle.lock().await = Some(status_retry_handle);

        let free_timeout_handle = {
            let lifecycle = self.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(FREE_TIMEOUT_CHECK_INTERVAL_SECS));
                while !lifecycle.should_exit.load(Ordering::Relaxed) {
                    ticker.tick().await;
                    lifecycle.check_free_timeout().await;
                }
            })
        };
        *self.free_timeout_handle.lock().await = Some(free_timeout_handle);

        self.spawn_consumer_if_ready().await;

        let reconnect_handle = {
            let lifecycle = self.clone();
            tokio::spawn(async move {
                let mut backoff = RECONNECT_BACKOFF_BASE_SECS;
                while !lifecycle.should_exit.load(Ordering::Relaxed) {
                    if lifecycle.consumer_running.load(Ordering::Relaxed) {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }

                    if lifecycle.broker.is_ready().await {
                        lifecycle.spawn_consumer_if_ready().await;
                        backoff = RECONNECT_BACKOFF_BASE_SECS;
                        continue;
                    }

                    warn!("broker not ready, reconnecting in {backoff}s");
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    if let Err(err) = lifecycle.broker.reconnect().await {
                        warn!(%err, "broker reconnect attempt failed");
                        backoff = (backoff * RECONNECT_BACKOFF_MULTIPLIER).min(RECONNECT_BACKOFF_CAP_SECS);
                    } else {
                        backoff = RECONNECT_BACKOFF_BASE_SECS;
                    }
                }
            })
        };
        *self.reconnect_handle.lock().await = Some(reconnect_handle);
    }

    /// Spawns the consumer task if the broker is ready and no consumer is
    /// already running. Restarted by the reconnect loop whenever the
    /// consumer exits (connection drop) and the broker becomes ready again.
    async fn spawn_consumer_if_ready(self: &Arc<Self>) {
        if self.consumer_running.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.broker.is_ready().await {
            self.consumer_running.store(false, Ordering::SeqCst);
            return;
        }

        let lifecycle = self.clone();
        let handle = tokio::spawn(async move {
            let inner = lifecycle.clone();
            let consume_result = lifecycle
                .broker
                .consume(move |delivery| {
                    let inner = inner.clone();
                    async move {
                        inner.handle_delivery(delivery).await;
                    }
                })
                .await;

            if let Err(err) = consume_result {
                warn!(%err, "broker consumer loop exited");
            }
            lifecycle.consumer_running.store(false, Ordering::SeqCst);
        });
        *self.consumer_handle.lock().await = Some(handle);
    }

    /// Releases the held task-protection resource once the worker has sat
    /// idle (status `Free`) for longer than `worker_config.free_timeout_seconds`.
    async fn check_free_timeout(&self) {
        let is_free = matches!(*self.current_status.read().await, WorkerStatus::Free);
        if !is_free {
            *self.free_since.write().await = None;
            return;
        }

        let since = {
            let mut guard = self.free_since.write().await;
            match *guard {
                Some(instant) => instant,
                None => {
                    let now = tokio::time::Instant::now();
                    *guard = Some(now);
                    now
                }
            }
        };

        if since.elapsed() >= Duration::from_secs(self.worker_config.free_timeout_seconds) {
            if let Err(err) = self.protection.release().await {
                warn!(%err, worker_id = %self.worker_id, "free-timeout release failed");
            }
        }
    }

    pub async fn stop(&self) {
        self.should_exit.store(true, Ordering::Relaxed);
        let cancel_timeout = Duration::from_secs(SHUTDOWN_TASK_CANCEL_TIMEOUT_SECS);

        if let Some(handle) = self.consumer_handle.lock().await.take() {
            handle.abort();
            let _ = timeout(cancel_timeout, handle).await;
        }
        if let Some(handle) = self.active_heartbeat.lock().await.take() {
            handle.abort();
            let _ = timeout(cancel_timeout, handle).await;
        }
        if let Some(handle) = self.reconnect_handle.lock().await.take() {
            handle.abort();
            let _ = timeout(cancel_timeout, handle).await;
        }
        if let Some(handle) = self.free_timeout_handle.lock().await.take() {
            handle.abort();
            let _ = timeout(cancel_timeout, handle).await;
        }
        if let Some(handle) = self.status_retry_handle.lock().await.take() {
            handle.abort();
            let _ = timeout(cancel_timeout, handle).await;
        }
        if let Some(presence) = self.presence.write().await.take() {
            presence.join(cancel_timeout).await;
        }

        self.protection.release().await.ok();
        let _ = timeout(
            Duration::from_secs(self.worker_config.shutdown_timeout_seconds),
            self.status_manager
                .publish_worker_status(&self.worker_id, WorkerStatus::Free, true),
        )
        .await;

        if let Err(err) = self.broker.disconnect().await {
            warn!(%err, "error disconnecting broker during shutdown");
        }

        info!(worker_id = %self.worker_id, "worker stopped");
    }

    fn worker_store(&self) -> Arc<dyn WorkerStore> {
        self.worker_store.clone()
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let envelope = delivery.envelope.clone();

        if envelope.correlation_id.trim().is_empty() || envelope.mandate.trim().is_empty() {
            warn!("dropping envelope missing correlation_id or mandate");
            let _ = delivery.ack().await;
            return;
        }

        if envelope.mandate.len() > self.worker_config.max_mandate_length {
            warn!(
                correlation_id = %envelope.correlation_id,
                "mandate too long: {} characters",
                envelope.mandate.len()
            );
            self.status_manager
                .publish_task_status(
                    &envelope.correlation_id,
                    TaskUpdate {
                        status: Some(TaskState::Failed),
                        error: Some(format!(
                            "Mandate too long: {} characters",
                            envelope.mandate.len()
                        )),
                        ..Default::default()
                    },
                    true,
                )
                .await
                .ok();
            let _ = delivery.ack().await;
            return;
        }

        // Worker-side idempotency: skip re-running a delivery whose
        // correlation_id is already in progress or terminal.
        if let Ok(Some(existing)) = self.fast_store.get_task(&envelope.correlation_id).await {
            if existing.status == TaskState::InProgress || existing.status.is_terminal() {
                info!(
                    correlation_id = %envelope.correlation_id,
                    "duplicate delivery of already-handled task, acking without re-run"
                );
                let _ = delivery.ack().await;
                return;
            }
        }

        self.protection.acquire().await.ok();
        *self.free_since.write().await = None;

        *self.current_status.write().await = WorkerStatus::Working {
            correlation_id: envelope.correlation_id.clone(),
        };

        self.status_manager
            .publish_task_status(
                &envelope.correlation_id,
                TaskUpdate {
                    status: Some(TaskState::Accepted),
                    ..Default::default()
                },
                true,
            )
            .await
            .ok();
        self.status_manager
            .publish_task_status(
                &envelope.correlation_id,
                TaskUpdate {
                    status: Some(TaskState::InProgress),
                    ..Default::default()
                },
                true,
            )
            .await
            .ok();
        self.status_manager
            .publish_worker_status(
                &self.worker_id,
                WorkerStatus::Working {
                    correlation_id: envelope.correlation_id.clone(),
                },
                true,
            )
            .await
            .ok();

        let (reporter, mut tick_rx) = TickReporter::new();
        let heartbeat_handle = {
            let manager = self.status_manager.clone();
            let correlation_id = envelope.correlation_id.clone();
            let worker_id = self.worker_id.clone();
            let interval_secs = self.status_config.heartbeat_interval_seconds;
            let heartbeat_timeout = Duration::from_secs(self.worker_config.heartbeat_timeout_seconds);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
                let mut last_tick: Option<u32> = None;
                loop {
                    ticker.tick().await;
                    let current = *tick_rx.borrow();
                    if last_tick != Some(current) {
                        last_tick = Some(current);
                        let publish = manager.publish_task_status(
                            &correlation_id,
                            TaskUpdate {
                                status: Some(TaskState::InProgress),
                                tick: Some(current),
                                ..Default::default()
                            },
                            true,
                        );
                        if timeout(heartbeat_timeout, publish).await.is_err() {
                            warn!(correlation_id = %correlation_id, "heartbeat status publish timed out");
                        }
                        let publish_worker = manager.publish_worker_status(
                            &worker_id,
                            WorkerStatus::Working {
                                correlation_id: correlation_id.clone(),
                            },
                            true,
                        );
                        let _ = timeout(heartbeat_timeout, publish_worker).await;
                    }
                }
            })
        };
        *self.active_heartbeat.lock().await = Some(heartbeat_handle);

        let task_timeout = Duration::from_secs(self.worker_config.task_timeout_seconds);
        let run_result = timeout(
            task_timeout,
            self.engine
                .run(&envelope.mandate, envelope.max_ticks, reporter),
        )
        .await;

        if let Some(handle) = self.active_heartbeat.lock().await.take() {
            handle.abort();
        }

        let update = match run_result {
            Ok(Ok(result)) => TaskUpdate {
                status: Some(TaskState::Completed),
                result: Some(result),
                ..Default::default()
            },
            Ok(Err(err)) => TaskUpdate {
                status: Some(TaskState::Failed),
                error: Some(err.to_string()),
                ..Default::default()
            },
            Err(_) => {
                let message = format!(
                    "Task execution timed out after {} seconds",
                    task_timeout.as_secs()
                );
                error!(correlation_id = %envelope.correlation_id, %message);
                TaskUpdate {
                    status: Some(TaskState::Failed),
                    error: Some(message),
                    ..Default::default()
                }
            }
        };

        self.status_manager
            .publish_task_status(&envelope.correlation_id, update, true)
            .await
            .ok();

        self.protection.release().await.ok();
        self.status_manager
            .publish_worker_status(&self.worker_id, WorkerStatus::Free, true)
            .await
            .ok();
        *self.current_status.write().await = WorkerStatus::Free;
        *self.free_since.write().await = Some(tokio::time::Instant::now());

        // Drain guard: block accepting the next envelope until pending
        // status updates flush, bounded by the resilient retry timeout.
        let drain_deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.status_config.resilient_retry_timeout_seconds);
        while self.status_manager.has_pending_updates().await {
            if tokio::time::Instant::now() >= drain_deadline {
                warn!(correlation_id = %envelope.correlation_id, "giving up waiting on pending status drain");
                break;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        let _ = delivery.ack().await;
    }
}
