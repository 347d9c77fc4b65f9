use thiserror::Error;

use crate::coordinator::CoordinatorError;
use crate::dag::DagError;
use crate::models::{RunId, TaskId};

/// Errors surfaced by the workflow manager and its internals.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A coordinator operation failed.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    /// A stored record could not be encoded or decoded. Fatal to the
    /// containing operation.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The submitted task tree is not a valid DAG.
    #[error(transparent)]
    Dag(#[from] DagError),

    /// The manager has not been started (or has been closed).
    #[error("workflow manager is not started")]
    NotStarted,

    /// `start` was called more than once.
    #[error("workflow manager was already started")]
    AlreadyStarted,

    /// The user task executor panicked. No completion record is written
    /// and the queue entry will be re-dispensed.
    #[error("task executor panicked for run {run_id} task {task_id}")]
    ExecutorPanicked {
        /// The run whose task panicked.
        run_id: RunId,
        /// The panicked task.
        task_id: TaskId,
    },
}

/// Result alias for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;
