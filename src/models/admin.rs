//! Read-only views returned by the manager's admin queries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{RunId, TaskId};
use super::run::TaskExecutionResult;
use super::task::TaskType;

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    /// The run's id.
    pub run_id: RunId,
    /// When the run was submitted.
    pub start_time_utc: DateTime<Utc>,
    /// When the run completed, if it has.
    pub completion_time_utc: Option<DateTime<Utc>>,
}

impl RunInfo {
    /// Returns true once the run has a completion marker.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.completion_time_utc.is_some()
    }
}

/// Static details of one task in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDetails {
    /// The task's id.
    pub task_id: TaskId,
    /// The task's type; `None` for structural tasks.
    pub task_type: Option<TaskType>,
    /// The task's metadata as stored.
    pub metadata: BTreeMap<String, String>,
}

/// Execution progress of one task.
///
/// A task is completed only when both a started record and a completed
/// record exist; started-only tasks are in flight; tasks with neither
/// have not started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// The task's id.
    pub task_id: TaskId,
    /// Worker instance that started the task, if any.
    pub instance_name: Option<String>,
    /// When execution started, if it has.
    pub start_date_utc: Option<DateTime<Utc>>,
    /// The execution result, if the task completed.
    pub result: Option<TaskExecutionResult>,
}

impl TaskInfo {
    /// A task with no started record.
    #[must_use]
    pub const fn not_started(task_id: TaskId) -> Self {
        Self {
            task_id,
            instance_name: None,
            start_date_utc: None,
            result: None,
        }
    }

    /// A task that started but has not completed.
    #[must_use]
    pub const fn started(
        task_id: TaskId,
        instance_name: String,
        start_date_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            instance_name: Some(instance_name),
            start_date_utc: Some(start_date_utc),
            result: None,
        }
    }

    /// A task with both a started and a completed record.
    #[must_use]
    pub const fn completed(
        task_id: TaskId,
        instance_name: String,
        start_date_utc: DateTime<Utc>,
        result: TaskExecutionResult,
    ) -> Self {
        Self {
            task_id,
            instance_name: Some(instance_name),
            start_date_utc: Some(start_date_utc),
            result: Some(result),
        }
    }

    /// Returns true if a started record exists.
    #[must_use]
    pub const fn has_started(&self) -> bool {
        self.start_date_utc.is_some()
    }

    /// Returns true if the task has an execution result.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}
