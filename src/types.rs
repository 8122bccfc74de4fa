//! Core data model: runs, steps, log entries, and their statuses.
//!
//! These types are the wire contract as well as the storage model. They must
//! serialize to the camelCase JSON shapes the HTTP surface and the SSE event
//! stream expose, so every serde attribute here is load-bearing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ═══════════════════════════════════════════════════════════════════════════
// Run Status
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// The string stored in the `runs.status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a stored status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Step Status
// ═══════════════════════════════════════════════════════════════════════════

/// Status of a memoized step row. Steps are only written on completion or
/// failure; there is no stored "running" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Log Level
// ═══════════════════════════════════════════════════════════════════════════

/// Severity of a structured log entry emitted from job code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Progress
// ═══════════════════════════════════════════════════════════════════════════

/// Coarse progress reported from inside a run via `StepContext::progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Units of work done so far.
    pub current: u64,

    /// Total units of work, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,

    /// Free-form status line for UIs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Run
// ═══════════════════════════════════════════════════════════════════════════

/// One execution of a job with a specific input.
///
/// A run is created `pending`, claimed by a worker into `running`, and ends
/// in exactly one of `completed`, `failed`, or `cancelled`. A `failed` or
/// `cancelled` run can be reset to `pending` by `retry`, keeping its step
/// rows so completed steps replay from cache on the next attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Unique, time-sortable identifier (UUIDv7).
    pub id: String,

    /// Name of the registered job this run executes.
    pub job_name: String,

    pub status: RunStatus,

    /// Opaque JSON input the job was triggered with.
    pub payload: Value,

    /// Job output; set only when status is `completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Failure message; set only when status is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Most recent progress report, if the job emitted any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,

    /// Index of the most recently recorded step.
    pub current_step_index: i64,

    /// Caller-supplied dedup key; unique per job when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Caller-supplied serialization key; at most one `running` run per key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_key: Option<String>,

    /// Set when an operator requested cancellation of a running attempt.
    /// Worker coordination state, not part of the wire contract.
    #[serde(skip)]
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,

    /// Set when the current (or last) attempt was claimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Set when the run reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Last liveness write from the owning worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// A run plus the derived step count, as returned by run listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunListEntry {
    #[serde(flatten)]
    pub run: Run,

    /// Number of step rows recorded for this run.
    pub step_count: i64,
}

/// Filter for `get_runs` / `GET /runs`.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub job_name: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Step
// ═══════════════════════════════════════════════════════════════════════════

/// One memoized checkpoint within a run.
///
/// Keyed by `(run_id, name)`. A `completed` row is immutable and replays
/// from cache on later attempts; a `failed` row is invisible to memoization
/// and is overwritten in place when the step re-executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub run_id: String,

    /// Step name, unique within the run.
    pub name: String,

    /// 0-based insertion order.
    pub index: i64,

    pub status: StepStatus,

    /// Memoized output; set when status is `completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Failure message; set when status is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Log Entry
// ═══════════════════════════════════════════════════════════════════════════

/// Structured log line emitted inside a step or at run scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub run_id: String,

    /// Name of the step that was executing, when emitted inside one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,

    pub level: LogLevel,
    pub message: String,

    /// Opaque structured payload attached to the line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    pub timestamp: DateTime<Utc>,
}
