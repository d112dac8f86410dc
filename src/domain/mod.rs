//! Shared contracts: the task envelope, the task state machine, the worker
//! status taxonomy, and the record shapes every other module exchanges.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Internal lifecycle state of a task. Only the worker servicing a task may
/// advance it out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Accepted,
    InProgress,
    Completed,
    Failed,
}

impl TaskState {
    /// True once a task cannot transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// External status vocabulary presented to HTTP callers.
    pub fn external(self) -> &'static str {
        match self {
            TaskState::Pending => "in_queue",
            TaskState::Accepted | TaskState::InProgress => "in_progress",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

/// The canonical per-task entity, as held by both the fast and durable stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub correlation_id: String,
    pub user_id: Option<String>,
    pub mandate: String,
    pub status: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tick: Option<u32>,
    pub max_ticks: u32,
    pub result: Option<CompletionResult>,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn new(correlation_id: String, user_id: Option<String>, mandate: String, max_ticks: u32) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            user_id,
            mandate,
            status: TaskState::Pending,
            created_at: now,
            updated_at: now,
            tick: None,
            max_ticks,
            result: None,
            error: None,
        }
    }

    /// Merges a sparse partial over this record, bumping `updated_at`.
    /// Mirrors the fast store's JSON-merge `update_task` semantics.
    pub fn apply(&mut self, partial: &TaskUpdate) {
        if let Some(status) = partial.status {
            self.status = status;
        }
        if let Some(ref mandate) = partial.mandate {
            self.mandate = mandate.clone();
        }
        if let Some(tick) = partial.tick {
            self.tick = Some(tick);
        }
        if let Some(max_ticks) = partial.max_ticks {
            self.max_ticks = max_ticks;
        }
        if let Some(ref result) = partial.result {
            self.result = Some(result.clone());
        }
        if let Some(ref error) = partial.error {
            self.error = Some(error.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Sparse partial update applied to a `TaskRecord`. Every field absent is
/// left untouched; this is the shape `StatusManager` composes and the fast/
/// durable stores merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mandate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ticks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CompletionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The agent's terminal deliverable, the one concrete result shape this
/// substrate commits to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    pub success: bool,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

/// The message placed on the broker. The envelope is the work order; the
/// `TaskRecord` is the state. Extra keys on the wire are tolerated and
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub correlation_id: String,
    pub mandate: String,
    pub max_ticks: u32,
}

/// The externally-visible representation of a task, status-normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub correlation_id: String,
    pub status: String,
    pub mandate: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CompletionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick: Option<u32>,
    pub max_ticks: u32,
}

impl From<TaskRecord> for TaskResponse {
    fn from(r: TaskRecord) -> Self {
        Self {
            correlation_id: r.correlation_id,
            status: r.status.external().to_string(),
            mandate: r.mandate,
            created_at: r.created_at,
            updated_at: r.updated_at,
            result: r.result,
            error: r.error,
            tick: r.tick,
            max_ticks: r.max_ticks,
        }
    }
}

/// Worker liveness/availability. `Working` carries the correlation id it is
/// currently handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerStatus {
    Free,
    Working { correlation_id: String },
}

/// A worker's published status plus the id it was stored under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusRecord {
    pub worker_id: String,
    #[serde(flatten)]
    pub status: WorkerStatus,
    pub updated_at: DateTime<Utc>,
}

/// Request body accepted at `POST /tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRequest {
    pub mandate: String,
    pub max_ticks: Option<u32>,
    pub correlation_id: Option<String>,
}

/// Arbitrary string-keyed metadata, used for worker-status payloads that
/// need more than a correlation id.
pub type Metadata = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_matches_lifecycle() {
        assert!(TaskState::Pending < TaskState::Accepted);
        assert!(TaskState::Accepted < TaskState::InProgress);
        assert!(TaskState::InProgress < TaskState::Completed);
    }

    #[test]
    fn terminal_states_are_completed_and_failed() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::InProgress.is_terminal());
    }

    #[test]
    fn external_vocabulary_normalizes_internal_states() {
        assert_eq!(TaskState::Pending.external(), "in_queue");
        assert_eq!(TaskState::Accepted.external(), "in_progress");
        assert_eq!(TaskState::InProgress.external(), "in_progress");
        assert_eq!(TaskState::Completed.external(), "completed");
        assert_eq!(TaskState::Failed.external(), "failed");
    }

    #[test]
    fn apply_merges_sparse_partial_and_bumps_updated_at() {
        let mut record = TaskRecord::new("c1".into(), Some("u1".into()), "do it".into(), 50);
        let created = record.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        record.apply(&TaskUpdate {
            status: Some(TaskState::InProgress),
            tick: Some(3),
            ..Default::default()
        });
        assert_eq!(record.status, TaskState::InProgress);
        assert_eq!(record.tick, Some(3));
        assert_eq!(record.mandate, "do it");
        assert!(record.updated_at > created);
    }
}
