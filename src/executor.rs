//! Dequeue-side task execution.
//!
//! [`TaskRunner`] is the queue callback for worker consumers. Its job is
//! to turn a dequeued task into exactly one durable completion record:
//! short-circuit when a record already exists, note the start, run the
//! user executor, and persist the result create-exclusively so the first
//! writer wins.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;

use crate::coordinator::{paths, Coordinator, CoordinatorError, CreateMode};
use crate::error::{WorkflowError, WorkflowResult};
use crate::manager::STATE_STARTED;
use crate::models::{strip_special_meta, ExecutableTask, StartedTask, TaskExecutionResult, TaskType};
use crate::queue::DequeueHandler;
use crate::serialization::encode;

/// User-supplied task business logic for one task type.
///
/// Executors must be idempotent for crash recovery: a task can be
/// invoked more than once, but only the first completion record sticks.
/// The metadata handed to the executor has the reserved priority/delay
/// key stripped.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Executes the task and returns its terminal result. Failures that
    /// should be recorded belong in the result; a panic is treated as an
    /// infrastructure fault and the task will be re-dispensed.
    async fn execute(&self, task: ExecutableTask) -> TaskExecutionResult;
}

/// Binds a [`TaskExecutor`] to a task type with a consumer pool size.
#[derive(Clone)]
pub struct TaskExecutorSpec {
    pub(crate) executor: Arc<dyn TaskExecutor>,
    pub(crate) qty: usize,
    pub(crate) task_type: TaskType,
}

impl TaskExecutorSpec {
    /// Creates a spec running `qty` consumers for `task_type`.
    #[must_use]
    pub fn new(executor: Arc<dyn TaskExecutor>, qty: usize, task_type: TaskType) -> Self {
        Self {
            executor,
            qty,
            task_type,
        }
    }
}

impl std::fmt::Debug for TaskExecutorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutorSpec")
            .field("qty", &self.qty)
            .field("task_type", &self.task_type)
            .finish_non_exhaustive()
    }
}

/// The dequeue callback wiring a consumer to a user executor.
pub(crate) struct TaskRunner {
    coordinator: Arc<dyn Coordinator>,
    instance_name: String,
    executor: Arc<dyn TaskExecutor>,
    manager_state: Arc<AtomicU8>,
}

impl TaskRunner {
    pub(crate) fn new(
        coordinator: Arc<dyn Coordinator>,
        instance_name: String,
        executor: Arc<dyn TaskExecutor>,
        manager_state: Arc<AtomicU8>,
    ) -> Self {
        Self {
            coordinator,
            instance_name,
            executor,
            manager_state,
        }
    }
}

#[async_trait]
impl DequeueHandler for TaskRunner {
    async fn handle(&self, task: ExecutableTask) -> WorkflowResult<()> {
        if self.manager_state.load(Ordering::SeqCst) != STATE_STARTED {
            // Dropped: the entry stays queued and another worker's
            // consumer will pick it up once our lock is gone.
            return Err(WorkflowError::NotStarted);
        }

        let completed_path = paths::completed_task_path(&task.run_id, &task.task_id);
        if self.coordinator.exists(&completed_path).await? {
            tracing::warn!(
                run_id = %task.run_id,
                task_id = %task.task_id,
                "Task already has a completion record - skipping (most likely a restart)"
            );
            return Ok(());
        }

        let started = StartedTask {
            instance_name: self.instance_name.clone(),
            start_date_utc: Utc::now(),
        };
        let started_path = paths::started_task_path(&task.run_id, &task.task_id);
        match self
            .coordinator
            .create(&started_path, encode(&started)?, CreateMode::Persistent)
            .await
        {
            Ok(_) | Err(CoordinatorError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            run_id = %task.run_id,
            task_id = %task.task_id,
            task_type = %task.task_type.name,
            "Executing task"
        );

        let run_id = task.run_id.clone();
        let task_id = task.task_id.clone();
        let type_name = task.task_type.name.clone();
        let user_task = ExecutableTask {
            metadata: strip_special_meta(&task.metadata),
            ..task
        };

        // Run the user executor on its own task so a panic is contained
        // and surfaces as a join error instead of killing the consumer.
        let executor = Arc::clone(&self.executor);
        let result = match tokio::spawn(async move { executor.execute(user_task).await }).await {
            Ok(result) => result,
            Err(join_error) => {
                tracing::error!(
                    run_id = %run_id,
                    task_id = %task_id,
                    error = %join_error,
                    "Task executor panicked; no completion record written"
                );
                counter!("dagq.tasks.panicked", "task_type" => type_name).increment(1);
                return Err(WorkflowError::ExecutorPanicked { run_id, task_id });
            }
        };

        let status_label = if result.is_success() { "success" } else { "failed" };
        match self
            .coordinator
            .create(&completed_path, encode(&result)?, CreateMode::Persistent)
            .await
        {
            Ok(_) => {
                counter!(
                    "dagq.tasks.executed",
                    "task_type" => type_name,
                    "status" => status_label
                )
                .increment(1);
                Ok(())
            }
            Err(CoordinatorError::AlreadyExists { .. }) => {
                // A peer finished first; its record wins and the task is
                // complete either way.
                tracing::warn!(
                    run_id = %run_id,
                    task_id = %task_id,
                    "Task executed twice - completion record already written by a peer"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
