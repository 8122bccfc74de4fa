//! Error taxonomies for the engine.
//!
//! Two layers with disjoint audiences:
//!
//! - [`RunError`] flows through job code. `StepContext::run` returns it, the
//!   job's `run_fn` propagates it with `?`, and the executor classifies it
//!   into a terminal run state. Cancellation travels here as a sentinel
//!   variant rather than as a user-visible failure.
//! - [`Error`] is the facade/API surface: what `trigger`, `retry`, `cancel`,
//!   and the HTTP layer report to callers.

use crate::storage::StorageError;

// ═══════════════════════════════════════════════════════════════════════════
// RunError - inside a run attempt
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome classification for an aborted run attempt.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A step's user function failed; the step row records the error.
    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    /// A second `run()` call reused a step name within one attempt.
    #[error("duplicate step name '{0}'")]
    DuplicateStepName(String),

    /// Cooperative cancellation sentinel. Not a user-visible failure; the
    /// executor turns it into the `cancelled` terminal state.
    #[error("run cancelled")]
    Cancelled,

    /// The store failed while recording run state. The run is left as-is
    /// for the reaper rather than marked failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Failure raised by job code outside any step.
    #[error("{0}")]
    Job(String),
}

impl From<anyhow::Error> for RunError {
    fn from(err: anyhow::Error) -> Self {
        RunError::Job(format!("{err:#}"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Error - facade and HTTP surface
// ═══════════════════════════════════════════════════════════════════════════

/// Errors surfaced to operators and API clients.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The instance configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `trigger` named a job that is not registered in this process.
    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    /// The payload failed the job's input validator.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operator action against a run in a disallowed state.
    #[error("invalid transition for run {run_id}: cannot {action} a {status} run")]
    InvalidTransition {
        run_id: String,
        action: &'static str,
        status: crate::types::RunStatus,
    },

    /// `trigger_and_wait` gave up waiting. The run keeps executing.
    #[error("timed out waiting for run {0}")]
    WaitTimeout(String),

    /// The awaited run failed.
    #[error("run {run_id} failed: {error}")]
    RunFailed {
        run_id: String,
        error: String,
        failed_step: Option<String>,
    },

    /// The awaited run was cancelled.
    #[error("run {0} was cancelled")]
    RunCancelled(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Error {
    /// Lift a storage-level rejection into the API taxonomy, mapping the
    /// storage's transition/not-found cases onto their API equivalents.
    pub(crate) fn from_storage(err: StorageError, action: &'static str) -> Self {
        match err {
            StorageError::RunNotFound(id) => Error::RunNotFound(id),
            StorageError::InvalidTransition { run_id, status } => Error::InvalidTransition {
                run_id,
                action,
                status,
            },
            other => Error::Storage(other),
        }
    }
}
