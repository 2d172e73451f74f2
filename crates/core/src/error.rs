//! Error taxonomy of the orchestrator.

use crate::types::{DagId, RunId, TaskId};
use std::time::Duration;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors raised while building a DAG. Fatal: the DAG never activates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    /// Adding the edge would close a cycle.
    #[error("Edge {upstream} -> {downstream} would create a cycle")]
    Cycle { upstream: TaskId, downstream: TaskId },

    /// An edge or upstream reference names a task that was never added.
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Task {0} is defined more than once")]
    DuplicateTask(TaskId),

    #[error("Invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("Invalid DAG definition: {0}")]
    Invalid(String),
}

/// Failure reported by a task callable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskFailure {
    /// Recoverable, retried per the task's retry policy.
    #[error("{0}")]
    Failed(String),

    /// The task asks to be marked skipped.
    #[error("Skipped: {0}")]
    Skip(String),

    /// Fails the instance immediately, remaining retries are ignored.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl TaskFailure {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn skip(msg: impl Into<String>) -> Self {
        Self::Skip(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(format!("{:#}", e))
    }
}

/// Errors surfaced by a run state store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed.
    #[error("Version conflict on run {run_id}: expected {expected}, found {found}")]
    Conflict {
        run_id: RunId,
        expected: u64,
        found: u64,
    },

    #[error("Storage backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Backend errors may be transient; conflicts never resolve by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Errors of the orchestrator's public surface.
///
/// A failed upstream is not an error here: it is recorded on the task
/// instance as `TaskState::UpstreamFailed`.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Dag(#[from] DagError),

    /// The scheduler refuses new runs until the failure counter is reset.
    #[error("Runs of DAG {dag_id} are suppressed after {consecutive_failed} consecutive failures (limit {limit})")]
    RunSuppressed {
        dag_id: DagId,
        consecutive_failed: u32,
        limit: u32,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown DAG: {0}")]
    UnknownDag(DagId),

    #[error("DAG {0} is already registered")]
    DuplicateDag(DagId),

    #[error("Unknown run: {0}")]
    UnknownRun(RunId),

    #[error("Run {0} is not active")]
    RunNotActive(RunId),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Persistence kept failing beyond the configured bound.
    #[error("Run state store unreachable after {attempts} attempts: {last_error}")]
    StoreUnavailable { attempts: u32, last_error: String },
}
