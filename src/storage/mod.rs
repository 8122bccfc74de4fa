//! Storage abstraction: the relational operations the engine is built on.
//!
//! Every mutation that maintains an invariant is a single transaction inside
//! the implementation. The trait is dialect-neutral; [`sqlite::SqliteStore`]
//! is the shipped implementation and other relational backends plug in
//! behind the same seam with only the SQL text changing.

pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::types::{LogEntry, Progress, Run, RunFilter, RunListEntry, RunStatus, Step, StepStatus};

pub use sqlite::SqliteStore;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run not found: {0}")]
    RunNotFound(String),

    /// Heartbeat or cancel request against a run that is not `running`.
    #[error("run {0} is not running")]
    NotRunning(String),

    /// A completed step row already exists under this `(run_id, name)`.
    #[error("duplicate step name '{name}' in run {run_id}")]
    DuplicateStepName { run_id: String, name: String },

    /// The requested status change is not allowed from the run's current
    /// status. The store is unchanged.
    #[error("invalid transition for run {run_id} in status {status}")]
    InvalidTransition { run_id: String, status: RunStatus },

    /// A stored row failed to decode (unknown status string, bad JSON).
    #[error("corrupt row: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Parameters for inserting a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub job_name: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub concurrency_key: Option<String>,
}

/// Result of a step write.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub name: String,
    pub index: i64,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Response from a heartbeat write.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatAck {
    /// Whether an operator has asked this run to cancel. The owning worker
    /// trips its in-memory flag when it sees this, which is how a cancel
    /// issued on a peer process reaches the attempt.
    pub cancel_requested: bool,
}

/// Relational store operations the engine requires.
///
/// Implementations must be safe for concurrent use: the worker loop, its
/// heartbeat task, and API handlers all share one handle.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Create or verify the schema. Idempotent.
    async fn migrate(&self) -> Result<()>;

    /// Insert a `pending` run. When `idempotency_key` is present and a run
    /// already exists for `(job_name, idempotency_key)`, returns the
    /// existing row with `created = false` and inserts nothing.
    async fn create_run(&self, new_run: NewRun) -> Result<(Run, bool)>;

    async fn get_run(&self, run_id: &str) -> Result<Run>;

    /// List runs newest-first with their derived step counts.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunListEntry>>;

    /// Atomically claim the oldest `pending` run whose `concurrency_key`
    /// has no `running` sibling: sets status to `running` and stamps
    /// `started_at`/`heartbeat_at`. Returns `None` when nothing is
    /// claimable. No two callers can observe the same row.
    async fn claim_next_pending_run(&self, worker_id: &str) -> Result<Option<Run>>;

    /// Record a step outcome and advance the run's `current_step_index`.
    ///
    /// A `failed` row under the same `(run_id, name)` is overwritten in
    /// place, keeping its original index; a `completed` row collides with
    /// [`StorageError::DuplicateStepName`].
    async fn upsert_step(&self, run_id: &str, step: NewStep) -> Result<Step>;

    /// Read one memoized step, if recorded.
    async fn get_step(&self, run_id: &str, name: &str) -> Result<Option<Step>>;

    /// All recorded steps for a run, ordered by index.
    async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>>;

    /// Stamp `heartbeat_at` for a `running` run and report whether
    /// cancellation has been requested.
    async fn heartbeat(&self, run_id: &str) -> Result<HeartbeatAck>;

    /// `running` -> `completed`, recording the output.
    async fn complete_run(&self, run_id: &str, output: &Value) -> Result<Run>;

    /// `running` -> `failed`, recording the error.
    async fn fail_run(&self, run_id: &str, error: &str) -> Result<Run>;

    /// `pending` or `running` -> `cancelled`.
    async fn cancel_run(&self, run_id: &str) -> Result<Run>;

    /// Flag a `running` run so its owning worker cancels cooperatively.
    async fn request_cancel(&self, run_id: &str) -> Result<()>;

    /// `failed` or `cancelled` -> `pending`, clearing attempt state while
    /// preserving step rows so completed steps replay from cache.
    async fn reset_run_to_pending(&self, run_id: &str) -> Result<Run>;

    /// Reset every `running` run whose heartbeat is older than `threshold`
    /// back to `pending`. Returns the affected run ids.
    async fn reap_stale_runs(&self, threshold: Duration) -> Result<Vec<String>>;

    /// Best-effort progress write; ignored for runs that no longer exist.
    async fn update_progress(&self, run_id: &str, progress: &Progress) -> Result<()>;

    async fn write_log(&self, entry: &LogEntry) -> Result<()>;

    /// A run's log rows in emission order.
    async fn list_logs(&self, run_id: &str) -> Result<Vec<LogEntry>>;

    /// Delete a terminal run together with its steps and logs.
    async fn delete_run(&self, run_id: &str) -> Result<()>;
}
