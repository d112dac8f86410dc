//! Periodic liveness heartbeat: writes a per-worker key to the fast store
//! under a TTL, refreshed on an interval comfortably shorter than the TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::domain::WorkerStatus;
use crate::storage::WorkerStore;

pub struct PresenceHandle {
    stop: tokio::sync::watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PresenceHandle {
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Signals the task to stop and waits up to `max_wait` for it to exit.
    pub async fn join(self, max_wait: Duration) {
        self.stop();
        if tokio::time::timeout(max_wait, self.handle).await.is_err() {
            warn!("presence task did not exit within shutdown timeout");
        }
    }
}

/// Spawns the presence task. Returns a handle that stops it; the task
/// itself exits once the worker process's current status (free/working)
/// stops being refreshed for one TTL period.
pub fn spawn(
    worker_id: String,
    worker_store: Arc<dyn WorkerStore>,
    heartbeat_interval: Duration,
    current_status: Arc<tokio::sync::RwLock<WorkerStatus>>,
) -> PresenceHandle {
    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = interval(heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = current_status.read().await.clone();
                    if let Err(err) = worker_store.publish_worker_status(&worker_id, &status).await {
                        debug!(%err, worker_id, "presence publish failed, will retry next tick");
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    PresenceHandle {
        stop: stop_tx,
        handle,
    }
}
