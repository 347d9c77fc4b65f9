//! The leader control loop that advances runs.
//!
//! Exactly one process holds scheduler leadership at a time (see
//! [`crate::selector`]). The leader scans active runs, enqueues tasks
//! whose predecessors are all effectively complete, marks runs complete,
//! and sweeps old runs through the auto-cleaner.
//!
//! Enqueueing is made restart-safe by a durable *queued marker* written
//! before the queue entry: a fresh leader re-enqueues every
//! marked-but-not-completed task, and the executor's completion-record
//! short-circuit makes the occasional duplicate dispense harmless.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tokio::sync::watch;

use crate::cleaner::AutoCleanerHolder;
use crate::config::SchedulerConfig;
use crate::coordinator::{paths, Coordinator, CoordinatorError, CreateMode};
use crate::error::WorkflowResult;
use crate::hooks::WorkflowHooks;
use crate::models::{ExecutableTask, RunId, RunInfo, RunnableTask, TaskId};
use crate::queue::TaskQueue;
use crate::serialization::{decode, encode};

/// Marks a run complete by conditionally updating its record at the
/// version captured when it was read. On contention the record is
/// re-read and the decision retried; a run that is already complete (or
/// already cleaned) is left alone. Cancellation uses exactly this path.
pub(crate) async fn complete_run(
    coordinator: &Arc<dyn Coordinator>,
    run_id: &RunId,
    mut runnable: RunnableTask,
    mut version: i64,
) -> WorkflowResult<()> {
    let run_path = paths::run_path(run_id);
    loop {
        runnable.completion_time_utc = Some(Utc::now());
        match coordinator.set(&run_path, encode(&runnable)?, Some(version)).await {
            Ok(_) => {
                tracing::info!(run_id = %run_id, "Run marked complete");
                return Ok(());
            }
            Err(CoordinatorError::VersionMismatch { .. }) => {
                let refreshed = match coordinator.get(&run_path).await {
                    Ok(versioned) => versioned,
                    Err(CoordinatorError::NotFound { .. }) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                let current: RunnableTask = decode(&refreshed.data)?;
                if current.is_complete() {
                    return Ok(());
                }
                runnable = current;
                version = refreshed.version;
            }
            Err(CoordinatorError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Removes every record of a run: started and completed task records,
/// queued markers, and finally the run record itself. Missing child
/// nodes are ignored. Returns false when the run does not exist.
pub(crate) async fn clean_run(
    coordinator: &Arc<dyn Coordinator>,
    run_id: &RunId,
) -> WorkflowResult<bool> {
    let run_path = paths::run_path(run_id);
    let versioned = match coordinator.get(&run_path).await {
        Ok(versioned) => versioned,
        Err(CoordinatorError::NotFound { .. }) => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let runnable: RunnableTask = decode(&versioned.data)?;

    for task_id in runnable.tasks.keys() {
        delete_ignore_missing(coordinator, &paths::started_task_path(run_id, task_id)).await?;
        delete_ignore_missing(coordinator, &paths::completed_task_path(run_id, task_id)).await?;
        delete_ignore_missing(coordinator, &paths::queued_task_path(run_id, task_id)).await?;
    }
    delete_ignore_missing(coordinator, &run_path).await?;

    counter!("dagq.runs.cleaned").increment(1);
    tracing::info!(run_id = %run_id, "Run cleaned");
    Ok(true)
}

async fn delete_ignore_missing(
    coordinator: &Arc<dyn Coordinator>,
    path: &str,
) -> WorkflowResult<()> {
    match coordinator.delete(path).await {
        Ok(()) | Err(CoordinatorError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A task is *effectively complete* when it has a completion record, or
/// when it is structural and all of its predecessors are effectively
/// complete. Structural tasks are transparent pass-throughs: they gate
/// their dependents on their own predecessors without ever executing.
fn effectively_complete<'a>(
    task_id: &'a TaskId,
    runnable: &'a RunnableTask,
    dependencies: &HashMap<&'a TaskId, &'a [TaskId]>,
    completed: &HashSet<TaskId>,
    memo: &mut HashMap<&'a TaskId, bool>,
) -> bool {
    if let Some(&known) = memo.get(task_id) {
        return known;
    }
    let value = match runnable.tasks.get(task_id) {
        Some(task) if task.executable => completed.contains(task_id),
        Some(_) => dependencies.get(task_id).is_none_or(|deps| {
            deps.iter()
                .all(|dep| effectively_complete(dep, runnable, dependencies, completed, memo))
        }),
        None => false,
    };
    memo.insert(task_id, value);
    value
}

fn dependency_map(runnable: &RunnableTask) -> HashMap<&TaskId, &[TaskId]> {
    runnable
        .entries
        .iter()
        .map(|entry| (&entry.task_id, entry.dependencies.as_slice()))
        .collect()
}

/// Computes the executable tasks whose predecessors are all effectively
/// complete, excluding tasks that already have a completion record. The
/// result follows the deterministic entry order of the run record.
pub(crate) fn compute_ready_tasks(
    runnable: &RunnableTask,
    completed: &HashSet<TaskId>,
) -> Vec<TaskId> {
    let dependencies = dependency_map(runnable);
    let mut memo = HashMap::new();
    let mut ready = Vec::new();

    for entry in &runnable.entries {
        let Some(task) = runnable.tasks.get(&entry.task_id) else {
            continue;
        };
        if !task.executable || completed.contains(&entry.task_id) {
            continue;
        }
        let deps_satisfied = entry.dependencies.iter().all(|dep| {
            effectively_complete(dep, runnable, &dependencies, completed, &mut memo)
        });
        if deps_satisfied {
            ready.push(entry.task_id.clone());
        }
    }

    ready
}

/// Returns true when every executable task has a completion record.
pub(crate) fn all_executable_complete(
    runnable: &RunnableTask,
    completed: &HashSet<TaskId>,
) -> bool {
    runnable
        .tasks
        .values()
        .filter(|task| task.executable)
        .all(|task| completed.contains(&task.task_id))
}

/// The control loop run while holding leadership.
pub(crate) struct Scheduler {
    coordinator: Arc<dyn Coordinator>,
    config: SchedulerConfig,
    hooks: WorkflowHooks,
    cleaner: AutoCleanerHolder,
}

impl Scheduler {
    pub(crate) fn new(
        coordinator: Arc<dyn Coordinator>,
        config: SchedulerConfig,
        hooks: WorkflowHooks,
        cleaner: AutoCleanerHolder,
    ) -> Self {
        Self {
            coordinator,
            config,
            hooks,
            cleaner,
        }
    }

    /// Runs scheduling passes until shutdown or a coordinator error.
    /// Errors bubble to the selector, which releases leadership and
    /// re-enters the election after a backoff.
    pub(crate) async fn run_as_leader(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WorkflowResult<()> {
        self.recover_marked_tasks().await?;

        let mut runs_watch = self.coordinator.watch_children(paths::RUNS_PARENT);
        let mut completed_watch = self
            .coordinator
            .watch_children(paths::COMPLETED_TASKS_PARENT);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            self.schedule_pass().await?;

            if self.cleaner.is_due() {
                if let Err(e) = self.clean_sweep().await {
                    tracing::warn!(error = %e, "Auto-clean sweep failed");
                }
                self.cleaner.mark_swept();
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.scan_interval) => {}
                _ = runs_watch.recv() => {}
                _ = completed_watch.recv() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Re-enqueues every marked-but-not-completed task. Run once per
    /// leadership tenure: a previous leader may have crashed between
    /// writing a marker and enqueueing, and re-enqueueing an entry that
    /// is still queued is safe because the executor short-circuits on an
    /// existing completion record.
    async fn recover_marked_tasks(&self) -> WorkflowResult<()> {
        let markers = self.coordinator.children(paths::QUEUED_TASKS_PARENT).await?;
        if markers.is_empty() {
            return Ok(());
        }
        let completed: HashSet<String> = self
            .coordinator
            .children(paths::COMPLETED_TASKS_PARENT)
            .await?
            .into_iter()
            .collect();

        for run_name in self.coordinator.children(paths::RUNS_PARENT).await? {
            let run_id = RunId::new(run_name);
            let versioned = match self.coordinator.get(&paths::run_path(&run_id)).await {
                Ok(versioned) => versioned,
                Err(CoordinatorError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            let runnable: RunnableTask = match decode(&versioned.data) {
                Ok(runnable) => runnable,
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "Skipping undecodable run record");
                    continue;
                }
            };
            if runnable.is_complete() {
                continue;
            }

            for marker in &markers {
                if completed.contains(marker) {
                    continue;
                }
                let Some(task_id) = paths::task_id_from_run_task_name(&run_id, marker) else {
                    continue;
                };
                let Some(task) = runnable.tasks.get(&task_id) else {
                    continue;
                };
                if !task.executable {
                    continue;
                }
                tracing::info!(
                    run_id = %run_id,
                    task_id = %task_id,
                    "Re-enqueueing marked task after leadership change"
                );
                self.queue_for(task).enqueue(task).await?;
                counter!("dagq.scheduler.requeued").increment(1);
            }
        }
        Ok(())
    }

    async fn schedule_pass(&self) -> WorkflowResult<()> {
        let run_names = self.coordinator.children(paths::RUNS_PARENT).await?;
        if run_names.is_empty() {
            return Ok(());
        }

        let completed_names: HashSet<String> = self
            .coordinator
            .children(paths::COMPLETED_TASKS_PARENT)
            .await?
            .into_iter()
            .collect();
        let queued_names: HashSet<String> = self
            .coordinator
            .children(paths::QUEUED_TASKS_PARENT)
            .await?
            .into_iter()
            .collect();

        for run_name in run_names {
            let run_id = RunId::new(run_name);
            let versioned = match self.coordinator.get(&paths::run_path(&run_id)).await {
                Ok(versioned) => versioned,
                // Cleaned between the listing and the read.
                Err(CoordinatorError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            let runnable: RunnableTask = match decode(&versioned.data) {
                Ok(runnable) => runnable,
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "Skipping undecodable run record");
                    continue;
                }
            };
            if runnable.is_complete() {
                continue;
            }

            self.advance_run(
                &run_id,
                runnable,
                versioned.version,
                &completed_names,
                &queued_names,
            )
            .await?;
        }
        Ok(())
    }

    async fn advance_run(
        &self,
        run_id: &RunId,
        runnable: RunnableTask,
        version: i64,
        completed_names: &HashSet<String>,
        queued_names: &HashSet<String>,
    ) -> WorkflowResult<()> {
        let completed: HashSet<TaskId> = runnable
            .tasks
            .keys()
            .filter(|task_id| completed_names.contains(&paths::run_task_name(run_id, task_id)))
            .cloned()
            .collect();

        if all_executable_complete(&runnable, &completed) {
            complete_run(&self.coordinator, run_id, runnable, version).await?;
            counter!("dagq.runs.completed").increment(1);
            self.hooks.run_completed(run_id);
            return Ok(());
        }

        for task_id in compute_ready_tasks(&runnable, &completed) {
            if queued_names.contains(&paths::run_task_name(run_id, &task_id)) {
                continue;
            }
            let Some(task) = runnable.tasks.get(&task_id) else {
                continue;
            };
            self.mark_and_enqueue(run_id, task).await?;
        }
        Ok(())
    }

    /// Writes the queued marker, then the queue entry, in that order: a
    /// crash in between leaves a marker the next tenure's recovery pass
    /// turns back into a queue entry.
    async fn mark_and_enqueue(&self, run_id: &RunId, task: &ExecutableTask) -> WorkflowResult<()> {
        let marker_path = paths::queued_task_path(run_id, &task.task_id);
        match self
            .coordinator
            .create(&marker_path, Vec::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) => {}
            // Another tenure already queued it.
            Err(CoordinatorError::AlreadyExists { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        self.queue_for(task).enqueue(task).await?;
        tracing::debug!(
            run_id = %run_id,
            task_id = %task.task_id,
            task_type = %task.task_type.name,
            "Task queued"
        );
        counter!("dagq.scheduler.queued").increment(1);
        self.hooks.task_queued(run_id, &task.task_id);
        Ok(())
    }

    fn queue_for(&self, task: &ExecutableTask) -> TaskQueue {
        TaskQueue::new(Arc::clone(&self.coordinator), task.task_type.clone())
    }

    async fn clean_sweep(&self) -> WorkflowResult<()> {
        let Some(cleaner) = self.cleaner.cleaner().cloned() else {
            return Ok(());
        };

        for run_name in self.coordinator.children(paths::RUNS_PARENT).await? {
            let run_id = RunId::new(run_name);
            let versioned = match self.coordinator.get(&paths::run_path(&run_id)).await {
                Ok(versioned) => versioned,
                Err(CoordinatorError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            let Ok(runnable) = decode::<RunnableTask>(&versioned.data) else {
                continue;
            };
            let run_info = RunInfo {
                run_id: run_id.clone(),
                start_time_utc: runnable.start_time_utc,
                completion_time_utc: runnable.completion_time_utc,
            };
            if cleaner.can_be_cleaned(&run_info) {
                clean_run(&self.coordinator, &run_id).await?;
            }
        }
        Ok(())
    }
}
