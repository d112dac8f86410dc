//! System-wide constants shared across the gateway, worker, and storage
//! layers.

/// Status-retry loop cadence for both the gateway's health probes and the
/// worker's pending-update drain.
pub const STATUS_RETRY_LOOP_INTERVAL_SECS: u64 = 10;

/// Worker presence keys carry a TTL this many times the heartbeat interval,
/// so a worker missing two or three beats still expires promptly without
/// flapping on normal jitter.
pub const WORKER_PRESENCE_TTL_FACTOR: u32 = 3;

/// Cap on the StatusManager's best-effort pending-update buffer.
pub const MAX_PENDING_STATUS_UPDATES: usize = 1024;

/// Fast-store create retry count on the gateway's admission path.
pub const FAST_STORE_CREATE_MAX_RETRIES: u32 = 3;

/// Backoff base for fast-store create retries: `0.5s * attempt`.
pub const FAST_STORE_CREATE_RETRY_BACKOFF_SECS: f64 = 0.5;

/// Worker broker-reconnect backoff parameters: base, multiplier, cap.
pub const RECONNECT_BACKOFF_BASE_SECS: f64 = 10.0;
pub const RECONNECT_BACKOFF_MULTIPLIER: f64 = 1.5;
pub const RECONNECT_BACKOFF_CAP_SECS: f64 = 60.0;

/// Per-task cancellation budget during graceful worker shutdown.
pub const SHUTDOWN_TASK_CANCEL_TIMEOUT_SECS: u64 = 2;

/// Polling cadence for the worker's free-timeout task.
pub const FREE_TIMEOUT_CHECK_INTERVAL_SECS: u64 = 5;

/// Default mandate length cap, overridable via config.
pub const DEFAULT_MAX_MANDATE_LENGTH: usize = 50_000;

/// Default max-ticks cap, overridable via config.
pub const DEFAULT_MAX_TICKS: u32 = 200;

/// Default per-submission max_ticks when the caller omits one.
pub const DEFAULT_SUBMISSION_MAX_TICKS: u32 = 50;
