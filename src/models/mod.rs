//! Domain records: ids, task types, the user-facing task tree, and the
//! durable records persisted in the coordinator.

mod admin;
mod ids;
mod run;
mod task;

pub use admin::{RunInfo, TaskDetails, TaskInfo};
pub use ids::{RunId, TaskId};
pub use run::{
    DagEntry, ExecutableTask, RunnableTask, StartedTask, TaskExecutionResult, TaskExecutionStatus,
};
pub use task::{Task, TaskMode, TaskType, SPECIAL_META_KEY};

pub(crate) use task::{special_meta_value, strip_special_meta};
