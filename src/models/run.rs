use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{RunId, TaskId};
use super::task::TaskType;

/// A task flattened out of a submitted DAG, as stored in the run record
/// and carried through the queues.
///
/// Structural tasks carry the null [`TaskType`] sentinel and
/// `executable = false`; the scheduler never enqueues them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableTask {
    /// The run this task belongs to.
    pub run_id: RunId,
    /// The task's id within the run.
    pub task_id: TaskId,
    /// The task's type; the null sentinel for structural tasks.
    pub task_type: TaskType,
    /// User metadata, including the reserved priority/delay key if set.
    pub metadata: BTreeMap<String, String>,
    /// Whether the scheduler may enqueue this task.
    pub executable: bool,
}

/// One adjacency entry of a run's dependency graph: the task and its
/// direct predecessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagEntry {
    /// The dependent task.
    pub task_id: TaskId,
    /// Tasks that must be effectively complete before `task_id` is ready.
    pub dependencies: Vec<TaskId>,
}

/// The durable record of one run, stored at `/runs/<runId>`.
///
/// Mutated only by the scheduler leader (completion marking) under a
/// version-checked update; everything else is written once at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnableTask {
    /// Every task in the run, keyed by id.
    pub tasks: BTreeMap<TaskId, ExecutableTask>,
    /// Dependency entries in deterministic topological order.
    pub entries: Vec<DagEntry>,
    /// When the run was submitted.
    pub start_time_utc: DateTime<Utc>,
    /// When the run completed or was cancelled. Once set, never cleared.
    pub completion_time_utc: Option<DateTime<Utc>>,
    /// The parent run for sub-workflows.
    pub parent_run_id: Option<RunId>,
}

impl RunnableTask {
    /// Returns true once a completion marker has been written.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.completion_time_utc.is_some()
    }
}

/// Record written by a worker when it begins executing a task, stored at
/// `/started-tasks/<runId>-<taskId>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedTask {
    /// Name of the worker instance that started the task.
    pub instance_name: String,
    /// When execution started.
    pub start_date_utc: DateTime<Utc>,
}

/// Terminal outcome of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskExecutionStatus {
    /// The task succeeded.
    Success,
    /// The task failed. Dependents will never become ready.
    Failed,
}

/// The durable result of a task execution, stored at
/// `/completed-tasks/<runId>-<taskId>`. Its creation is the atomic
/// completion signal: it is written create-exclusively and at most one
/// such record ever exists per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    /// Terminal status.
    pub status: TaskExecutionStatus,
    /// Free-form message from the executor.
    pub message: String,
    /// Result metadata handed to downstream consumers.
    pub result_data: BTreeMap<String, String>,
    /// When the execution finished.
    pub completion_time_utc: DateTime<Utc>,
}

impl TaskExecutionResult {
    /// Creates a result with the current time and no result data.
    #[must_use]
    pub fn new(status: TaskExecutionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            result_data: BTreeMap::new(),
            completion_time_utc: Utc::now(),
        }
    }

    /// Sets the result metadata.
    #[must_use]
    pub fn with_result_data(mut self, result_data: BTreeMap<String, String>) -> Self {
        self.result_data = result_data;
        self
    }

    /// Returns true for a successful execution.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, TaskExecutionStatus::Success)
    }
}
