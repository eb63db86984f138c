//! Execution store: the keyed record of every task execution
//!
//! The store tracks one record per envelope id through
//! PENDING -> RUNNING -> {SUCCESS, FAILED}, with re-entry to PENDING on
//! retry or snooze, plus an append-only error log. Implementations must
//! keep three indexes mutually consistent: the primary record, a timeline
//! ordered by creation time, and one set per status.

mod memory;

pub use memory::MemoryTaskStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default page size for listings when the caller does not set one.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record exists for the id.
    #[error("task execution not found: {0}")]
    NotFound(Uuid),

    /// Record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Current state of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Failed,
    ];
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// One entry in a record's append-only error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// The store's view of one envelope's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task_kind: String,
    pub status: TaskStatus,
    pub args: serde_json::Value,
    #[serde(default)]
    pub retried: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qstash_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ExecutionError>,
    #[serde(default)]
    pub queue: String,
}

impl TaskExecution {
    /// A fresh PENDING record with the creation time stamped.
    pub fn new(id: Uuid, task_kind: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id,
            task_kind: task_kind.into(),
            status: TaskStatus::Pending,
            args,
            retried: 0,
            max_retries: 0,
            qstash_message_id: None,
            schedule_id: None,
            created_at: Utc::now(),
            attempted_at: None,
            scheduled_at: None,
            finalized_at: None,
            errors: Vec::new(),
            queue: String::new(),
        }
    }
}

/// Filter for listing executions: by status, or by creation-time range.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Maximum records returned; zero falls back to [`DEFAULT_LIST_LIMIT`].
    pub limit: usize,
}

/// Key-addressable record of every execution.
///
/// Operations that touch more than one index (create, status updates,
/// delete, cleanup) must run as a single atomic batch. Concurrent updates
/// to distinct ids may run in parallel; on the same id last-writer-wins is
/// acceptable because the dispatch pipeline holds an id once per attempt.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Insert a record, defaulting `created_at` when unset, and index it on
    /// the timeline and its status set.
    async fn create(&self, record: TaskExecution) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<TaskExecution, StoreError>;

    async fn exists(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Remove the record from the primary map and every index.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Atomic status transition with derived timestamps: `attempted_at` on
    /// RUNNING, `finalized_at` on SUCCESS or FAILED, and a `retried`
    /// increment when re-entering PENDING.
    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError>;

    /// Snooze transition: back to PENDING with the future delivery time
    /// recorded. The PENDING re-entry increment is credited back so a
    /// snooze never consumes retry budget.
    async fn update_snoozed(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Append to the record's error log, defaulting the timestamp.
    async fn add_error(&self, id: Uuid, error: ExecutionError) -> Result<(), StoreError>;

    /// List executions newest-first, filtered by status or creation range.
    async fn list(&self, filter: TaskFilter) -> Result<Vec<TaskExecution>, StoreError>;

    /// The most recently created executions across all statuses.
    async fn most_recent(&self, limit: usize) -> Result<Vec<TaskExecution>, StoreError>;

    /// Batch-remove records created before `now - older_than`.
    async fn cleanup(&self, older_than: Duration) -> Result<(), StoreError>;
}
