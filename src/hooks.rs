//! Observability callbacks injected at construction time.
//!
//! Test harnesses (and operators wanting cheap instrumentation) can
//! observe scheduler decisions without global state: the hooks ride the
//! manager from the builder and fire synchronously inside the scheduler
//! loop, so they must be fast and must not block.

use std::fmt;
use std::sync::Arc;

use crate::models::{RunId, TaskId};

type TaskQueuedFn = dyn Fn(&RunId, &TaskId) + Send + Sync;
type RunCompletedFn = dyn Fn(&RunId) + Send + Sync;

/// Optional callbacks fired by the scheduler leader.
#[derive(Clone, Default)]
pub struct WorkflowHooks {
    on_task_queued: Option<Arc<TaskQueuedFn>>,
    on_run_completed: Option<Arc<RunCompletedFn>>,
}

impl WorkflowHooks {
    /// Creates an empty hook set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fired after a task is durably marked queued and enqueued.
    #[must_use]
    pub fn with_task_queued(mut self, f: impl Fn(&RunId, &TaskId) + Send + Sync + 'static) -> Self {
        self.on_task_queued = Some(Arc::new(f));
        self
    }

    /// Fired after the scheduler marks a run complete.
    #[must_use]
    pub fn with_run_completed(mut self, f: impl Fn(&RunId) + Send + Sync + 'static) -> Self {
        self.on_run_completed = Some(Arc::new(f));
        self
    }

    pub(crate) fn task_queued(&self, run_id: &RunId, task_id: &TaskId) {
        if let Some(f) = &self.on_task_queued {
            f(run_id, task_id);
        }
    }

    pub(crate) fn run_completed(&self, run_id: &RunId) {
        if let Some(f) = &self.on_run_completed {
            f(run_id);
        }
    }
}

impl fmt::Debug for WorkflowHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowHooks")
            .field("on_task_queued", &self.on_task_queued.is_some())
            .field("on_run_completed", &self.on_run_completed.is_some())
            .finish()
    }
}
