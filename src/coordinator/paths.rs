//! The coordinator namespace layout.
//!
//! These paths are a compatibility-sensitive external interface: other
//! tooling reads the same tree. Task-scoped records live under flat
//! parents with `<runId>-<taskId>` child names so that one listing
//! covers every run.

use crate::models::{RunId, TaskId, TaskType};

/// Parent of all run records.
pub const RUNS_PARENT: &str = "/runs";
/// Parent of all started-task records.
pub const STARTED_TASKS_PARENT: &str = "/started-tasks";
/// Parent of all completed-task records.
pub const COMPLETED_TASKS_PARENT: &str = "/completed-tasks";
/// Parent of all queued markers.
pub const QUEUED_TASKS_PARENT: &str = "/queued-tasks";
/// Election path for the scheduler leader.
pub const SCHEDULER_LEADER_PATH: &str = "/scheduler-leader";

/// `/runs/<runId>`
#[must_use]
pub fn run_path(run_id: &RunId) -> String {
    format!("{RUNS_PARENT}/{run_id}")
}

/// The `<runId>-<taskId>` child name shared by started/completed/queued
/// records.
#[must_use]
pub fn run_task_name(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{run_id}-{task_id}")
}

/// `/started-tasks/<runId>-<taskId>`
#[must_use]
pub fn started_task_path(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{STARTED_TASKS_PARENT}/{}", run_task_name(run_id, task_id))
}

/// `/completed-tasks/<runId>-<taskId>`
#[must_use]
pub fn completed_task_path(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{COMPLETED_TASKS_PARENT}/{}", run_task_name(run_id, task_id))
}

/// `/queued-tasks/<runId>-<taskId>`
#[must_use]
pub fn queued_task_path(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{QUEUED_TASKS_PARENT}/{}", run_task_name(run_id, task_id))
}

/// Extracts the task id from a `<runId>-<taskId>` child name, given the
/// run id. Returns `None` when the name belongs to a different run.
#[must_use]
pub fn task_id_from_run_task_name(run_id: &RunId, name: &str) -> Option<TaskId> {
    let rest = name.strip_prefix(run_id.as_str())?;
    let rest = rest.strip_prefix('-')?;
    (!rest.is_empty()).then(|| TaskId::new(rest))
}

/// `/queue-<typeName>-<typeVersion>`
#[must_use]
pub fn queue_path(task_type: &TaskType) -> String {
    format!("/queue-{}", task_type.queue_key())
}

/// `/queue-locks-<typeName>-<typeVersion>/<entryName>`
#[must_use]
pub fn queue_lock_path(task_type: &TaskType, entry_name: &str) -> String {
    format!("/queue-locks-{}/{entry_name}", task_type.queue_key())
}
