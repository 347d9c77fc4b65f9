//! The workflow manager facade: lifecycle, submission, cancellation,
//! admin queries, and shutdown.
//!
//! One manager per process. `start` wires the scheduler's
//! leader-election loop and this process's consumer pools; any number of
//! managers across machines can share a coordinator, and together they
//! form the cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::cleaner::{AutoCleaner, AutoCleanerHolder};
use crate::config::{ConsumerConfig, SchedulerConfig};
use crate::coordinator::{paths, Coordinator, CoordinatorError, CreateMode};
use crate::dag;
use crate::error::{WorkflowError, WorkflowResult};
use crate::executor::{TaskExecutor, TaskExecutorSpec, TaskRunner};
use crate::hooks::WorkflowHooks;
use crate::models::{
    ExecutableTask, RunId, RunInfo, RunnableTask, StartedTask, Task, TaskDetails,
    TaskExecutionResult, TaskId, TaskInfo, TaskType,
};
use crate::queue::QueueConsumer;
use crate::scheduler::{clean_run, complete_run, Scheduler};
use crate::selector::SchedulerSelector;
use crate::serialization::{decode, encode};

pub(crate) const STATE_LATENT: u8 = 0;
pub(crate) const STATE_STARTED: u8 = 1;
pub(crate) const STATE_CLOSED: u8 = 2;

/// How long `close` waits for loops to drain before aborting them.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Builds a [`WorkflowManager`].
pub struct WorkflowManagerBuilder {
    coordinator: Arc<dyn Coordinator>,
    instance_name: String,
    specs: Vec<TaskExecutorSpec>,
    auto_cleaner: Option<Arc<dyn AutoCleaner>>,
    cleaner_period: Duration,
    consumer_config: ConsumerConfig,
    scheduler_config: SchedulerConfig,
    hooks: WorkflowHooks,
    deferred_consumers: bool,
}

impl WorkflowManagerBuilder {
    /// Creates a builder for a manager connected to `coordinator`.
    /// `instance_name` identifies this process in started-task records
    /// and logs.
    pub fn new(coordinator: Arc<dyn Coordinator>, instance_name: impl Into<String>) -> Self {
        Self {
            coordinator,
            instance_name: instance_name.into(),
            specs: Vec::new(),
            auto_cleaner: None,
            cleaner_period: Duration::from_secs(60),
            consumer_config: ConsumerConfig::default(),
            scheduler_config: SchedulerConfig::default(),
            hooks: WorkflowHooks::new(),
            deferred_consumers: false,
        }
    }

    /// Registers `qty` consumers running `executor` for `task_type`.
    #[must_use]
    pub fn adding_task_executor(
        mut self,
        executor: Arc<dyn TaskExecutor>,
        qty: usize,
        task_type: TaskType,
    ) -> Self {
        self.specs
            .push(TaskExecutorSpec::new(executor, qty, task_type));
        self
    }

    /// Enables the auto-cleaner with the given predicate and sweep
    /// period. Sweeps run on the scheduler leader only.
    #[must_use]
    pub fn with_auto_cleaner(mut self, cleaner: Arc<dyn AutoCleaner>, period: Duration) -> Self {
        self.auto_cleaner = Some(cleaner);
        self.cleaner_period = period;
        self
    }

    /// Overrides the consumer polling configuration.
    #[must_use]
    pub fn with_consumer_config(mut self, config: ConsumerConfig) -> Self {
        self.consumer_config = config;
        self
    }

    /// Overrides the scheduler loop configuration.
    #[must_use]
    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Installs observability hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: WorkflowHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Leaves consumers stopped after `start`; call
    /// [`WorkflowManager::start_task_consumers`] to start them. Lets
    /// test harnesses stage queue contents before consumption begins.
    #[must_use]
    pub const fn with_deferred_consumers(mut self) -> Self {
        self.deferred_consumers = true;
        self
    }

    /// Builds the manager in the latent state.
    #[must_use]
    pub fn build(self) -> WorkflowManager {
        let (shutdown_tx, _) = watch::channel(false);
        WorkflowManager {
            inner: Arc::new(ManagerInner {
                coordinator: self.coordinator,
                instance_name: self.instance_name,
                state: Arc::new(AtomicU8::new(STATE_LATENT)),
                specs: self.specs,
                auto_cleaner: self.auto_cleaner,
                cleaner_period: self.cleaner_period,
                consumer_config: self.consumer_config,
                scheduler_config: self.scheduler_config,
                hooks: self.hooks,
                deferred_consumers: self.deferred_consumers,
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
                consumers_started: AtomicBool::new(false),
            }),
        }
    }
}

struct ManagerInner {
    coordinator: Arc<dyn Coordinator>,
    instance_name: String,
    state: Arc<AtomicU8>,
    specs: Vec<TaskExecutorSpec>,
    auto_cleaner: Option<Arc<dyn AutoCleaner>>,
    cleaner_period: Duration,
    consumer_config: ConsumerConfig,
    scheduler_config: SchedulerConfig,
    hooks: WorkflowHooks,
    deferred_consumers: bool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    consumers_started: AtomicBool,
}

/// Facade over the whole engine. Cheap to clone; all clones share one
/// lifecycle.
#[derive(Clone)]
pub struct WorkflowManager {
    inner: Arc<ManagerInner>,
}

impl WorkflowManager {
    /// Starts the manager: enters scheduler leader election and (unless
    /// deferred) starts this process's queue consumers. Must be called
    /// exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::AlreadyStarted`] on a second call.
    pub async fn start(&self) -> WorkflowResult<()> {
        if self
            .inner
            .state
            .compare_exchange(STATE_LATENT, STATE_STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WorkflowError::AlreadyStarted);
        }

        let scheduler = Scheduler::new(
            Arc::clone(&self.inner.coordinator),
            self.inner.scheduler_config.clone(),
            self.inner.hooks.clone(),
            AutoCleanerHolder::new(self.inner.auto_cleaner.clone(), self.inner.cleaner_period),
        );
        let selector = SchedulerSelector::new(
            Arc::clone(&self.inner.coordinator),
            scheduler,
            self.inner.scheduler_config.clone(),
        );
        {
            let mut tasks = self.inner.tasks.lock().await;
            tasks.push(tokio::spawn(
                selector.run(self.inner.shutdown_tx.subscribe()),
            ));
        }

        if !self.inner.deferred_consumers {
            self.start_task_consumers().await?;
        }

        tracing::info!(
            instance_name = %self.inner.instance_name,
            task_types = self.inner.specs.len(),
            "Workflow manager started"
        );
        Ok(())
    }

    /// Starts this process's queue consumers. Idempotent; called by
    /// `start` unless consumers were deferred.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::NotStarted`] unless the manager is
    /// started.
    pub async fn start_task_consumers(&self) -> WorkflowResult<()> {
        if self.inner.state.load(Ordering::SeqCst) != STATE_STARTED {
            return Err(WorkflowError::NotStarted);
        }
        if self.inner.consumers_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = self.inner.tasks.lock().await;
        for spec in &self.inner.specs {
            for _ in 0..spec.qty {
                let runner = Arc::new(TaskRunner::new(
                    Arc::clone(&self.inner.coordinator),
                    self.inner.instance_name.clone(),
                    Arc::clone(&spec.executor),
                    Arc::clone(&self.inner.state),
                ));
                let consumer = QueueConsumer::new(
                    Arc::clone(&self.inner.coordinator),
                    spec.task_type.clone(),
                    runner,
                    self.inner.consumer_config.clone(),
                );
                tasks.push(tokio::spawn(
                    consumer.run(self.inner.shutdown_tx.subscribe()),
                ));
            }
        }
        Ok(())
    }

    /// Submits a task DAG, creating a new run. Returns the run id.
    pub async fn submit_task(&self, task: &Task) -> WorkflowResult<RunId> {
        self.submit(None, task).await
    }

    /// Submits a task DAG as a sub-workflow of `parent_run_id`. The
    /// child run completes independently of its parent.
    pub async fn submit_sub_task(
        &self,
        parent_run_id: RunId,
        task: &Task,
    ) -> WorkflowResult<RunId> {
        self.submit(Some(parent_run_id), task).await
    }

    async fn submit(&self, parent_run_id: Option<RunId>, task: &Task) -> WorkflowResult<RunId> {
        if self.inner.state.load(Ordering::SeqCst) != STATE_STARTED {
            return Err(WorkflowError::NotStarted);
        }

        let flattened = dag::flatten(task)?;
        let run_id = RunId::generate();

        let tasks: BTreeMap<TaskId, ExecutableTask> = flattened
            .tasks
            .iter()
            .map(|(task_id, task)| {
                (
                    task_id.clone(),
                    ExecutableTask {
                        run_id: run_id.clone(),
                        task_id: task_id.clone(),
                        task_type: task
                            .task_type()
                            .cloned()
                            .unwrap_or_else(TaskType::null_type),
                        metadata: task.metadata().clone(),
                        executable: task.is_executable(),
                    },
                )
            })
            .collect();

        let runnable = RunnableTask {
            tasks,
            entries: flattened.entries,
            start_time_utc: Utc::now(),
            completion_time_utc: None,
            parent_run_id,
        };

        self.inner
            .coordinator
            .create(
                &paths::run_path(&run_id),
                encode(&runnable)?,
                CreateMode::Persistent,
            )
            .await?;

        counter!("dagq.runs.submitted").increment(1);
        tracing::info!(
            run_id = %run_id,
            tasks = runnable.tasks.len(),
            "Run submitted"
        );
        Ok(run_id)
    }

    /// Cancels a run by forcing its completion marker. Tasks already in
    /// flight run to completion; their results are simply ignored by the
    /// run's terminal state. Returns false when the run does not exist.
    pub async fn cancel_run(&self, run_id: &RunId) -> WorkflowResult<bool> {
        tracing::info!(run_id = %run_id, "Cancelling run");
        let versioned = match self.inner.coordinator.get(&paths::run_path(run_id)).await {
            Ok(versioned) => versioned,
            Err(CoordinatorError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let runnable: RunnableTask = decode(&versioned.data)?;
        complete_run(&self.inner.coordinator, run_id, runnable, versioned.version).await?;
        Ok(true)
    }

    /// Returns a task's execution result, or `None` if it has not
    /// completed.
    pub async fn get_task_execution_result(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> WorkflowResult<Option<TaskExecutionResult>> {
        match self
            .inner
            .coordinator
            .get(&paths::completed_task_path(run_id, task_id))
            .await
        {
            Ok(versioned) => Ok(Some(decode(&versioned.data)?)),
            Err(CoordinatorError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns a run's summary, or `None` if the run does not exist
    /// (never submitted, or already cleaned).
    pub async fn get_run_info(&self, run_id: &RunId) -> WorkflowResult<Option<RunInfo>> {
        match self.read_runnable(run_id).await? {
            Some((runnable, _)) => Ok(Some(RunInfo {
                run_id: run_id.clone(),
                start_time_utc: runnable.start_time_utc,
                completion_time_utc: runnable.completion_time_utc,
            })),
            None => Ok(None),
        }
    }

    /// Returns summaries of every run. Runs deleted while listing are
    /// skipped.
    pub async fn list_run_info(&self) -> WorkflowResult<Vec<RunInfo>> {
        let mut result = Vec::new();
        for run_name in self.inner.coordinator.children(paths::RUNS_PARENT).await? {
            let run_id = RunId::new(run_name);
            if let Some((runnable, _)) = self.read_runnable(&run_id).await? {
                result.push(RunInfo {
                    run_id,
                    start_time_utc: runnable.start_time_utc,
                    completion_time_utc: runnable.completion_time_utc,
                });
            }
        }
        Ok(result)
    }

    /// Returns the static details of every task in a run, keyed by id.
    /// Structural tasks report no task type. Empty when the run does not
    /// exist.
    pub async fn get_task_details(
        &self,
        run_id: &RunId,
    ) -> WorkflowResult<BTreeMap<TaskId, TaskDetails>> {
        let Some((runnable, _)) = self.read_runnable(run_id).await? else {
            return Ok(BTreeMap::new());
        };
        Ok(runnable
            .tasks
            .into_iter()
            .map(|(task_id, task)| {
                let task_type = (!task.task_type.is_null_type()).then_some(task.task_type);
                (
                    task_id.clone(),
                    TaskDetails {
                        task_id,
                        task_type,
                        metadata: task.metadata,
                    },
                )
            })
            .collect())
    }

    /// Returns the execution progress of every executable task in a
    /// run: completed (started + completed records), started-only, and
    /// not-started. Empty when the run does not exist.
    pub async fn get_task_info(&self, run_id: &RunId) -> WorkflowResult<Vec<TaskInfo>> {
        let Some((runnable, _)) = self.read_runnable(run_id).await? else {
            return Ok(Vec::new());
        };

        let mut not_started: BTreeSet<TaskId> = runnable
            .tasks
            .values()
            .filter(|task| task.executable)
            .map(|task| task.task_id.clone())
            .collect();

        let mut started: BTreeMap<TaskId, StartedTask> = BTreeMap::new();
        for child in self
            .inner
            .coordinator
            .children(paths::STARTED_TASKS_PARENT)
            .await?
        {
            let Some(task_id) = paths::task_id_from_run_task_name(run_id, &child) else {
                continue;
            };
            match self
                .inner
                .coordinator
                .get(&format!("{}/{child}", paths::STARTED_TASKS_PARENT))
                .await
            {
                Ok(versioned) => {
                    started.insert(task_id.clone(), decode(&versioned.data)?);
                    not_started.remove(&task_id);
                }
                // Cleaned in the interim.
                Err(CoordinatorError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut infos = Vec::new();
        for child in self
            .inner
            .coordinator
            .children(paths::COMPLETED_TASKS_PARENT)
            .await?
        {
            let Some(task_id) = paths::task_id_from_run_task_name(run_id, &child) else {
                continue;
            };
            // Completed requires a started record too; a bare completed
            // record means the started record was already cleaned.
            let Some(started_task) = started.remove(&task_id) else {
                continue;
            };
            match self
                .inner
                .coordinator
                .get(&format!("{}/{child}", paths::COMPLETED_TASKS_PARENT))
                .await
            {
                Ok(versioned) => {
                    not_started.remove(&task_id);
                    infos.push(TaskInfo::completed(
                        task_id,
                        started_task.instance_name,
                        started_task.start_date_utc,
                        decode(&versioned.data)?,
                    ));
                }
                Err(CoordinatorError::NotFound { .. }) => {
                    started.insert(task_id, started_task);
                }
                Err(e) => return Err(e.into()),
            }
        }

        for (task_id, started_task) in started {
            infos.push(TaskInfo::started(
                task_id,
                started_task.instance_name,
                started_task.start_date_utc,
            ));
        }
        for task_id in not_started {
            infos.push(TaskInfo::not_started(task_id));
        }
        Ok(infos)
    }

    /// Removes every record of a run. Returns false when the run does
    /// not exist. Normally invoked by the auto-cleaner, but safe to call
    /// directly.
    pub async fn clean(&self, run_id: &RunId) -> WorkflowResult<bool> {
        clean_run(&self.inner.coordinator, run_id).await
    }

    /// This process's instance name.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.inner.instance_name
    }

    /// The coordinator handle this manager runs on.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.inner.coordinator
    }

    /// Shuts down consumers and releases scheduler leadership.
    /// Idempotent; loops that do not drain within a grace period are
    /// aborted.
    pub async fn close(&self) {
        let previous = self.inner.state.swap(STATE_CLOSED, Ordering::SeqCst);
        if previous != STATE_STARTED {
            return;
        }

        let _ = self.inner.shutdown_tx.send(true);
        let mut tasks = self.inner.tasks.lock().await;
        for mut handle in tasks.drain(..) {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        tracing::info!(
            instance_name = %self.inner.instance_name,
            "Workflow manager closed"
        );
    }

    async fn read_runnable(
        &self,
        run_id: &RunId,
    ) -> WorkflowResult<Option<(RunnableTask, i64)>> {
        match self.inner.coordinator.get(&paths::run_path(run_id)).await {
            Ok(versioned) => Ok(Some((decode(&versioned.data)?, versioned.version))),
            Err(CoordinatorError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for WorkflowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowManager")
            .field("instance_name", &self.inner.instance_name)
            .field("state", &self.inner.state.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
