//! dagq - Coordinator-Backed Task DAG Orchestration
//!
//! A distributed workflow engine that runs DAGs of tasks across a fleet
//! of worker processes, using a strongly-consistent hierarchical
//! coordination store for durable state, leader election, and queueing.
//! No broker, no database: workers share nothing but the coordinator.
//!
//! Submit a task DAG and get back a run id; a leader-elected scheduler
//! enqueues tasks as their predecessors complete; per-task-type durable
//! queues (FIFO, priority, or delayed) feed consumers that execute user
//! code and persist at most one completion record per task. Crash-safety
//! falls out of three idempotent primitives: create-exclusive completion
//! records, durable queued markers, and ephemeral per-entry locks.

pub mod cleaner;
pub mod config;
pub mod coordinator;
pub mod dag;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod manager;
pub mod models;
mod queue;
mod scheduler;
mod selector;
mod serialization;

pub use cleaner::{AutoCleaner, StandardAutoCleaner};
pub use config::{ConsumerConfig, PollingStrategy, SchedulerConfig};
pub use coordinator::memory::{MemoryCluster, MemorySession};
pub use coordinator::{Coordinator, CoordinatorError, CreateMode, VersionedData};
pub use dag::DagError;
pub use error::{WorkflowError, WorkflowResult};
pub use executor::{TaskExecutor, TaskExecutorSpec};
pub use hooks::WorkflowHooks;
pub use manager::{WorkflowManager, WorkflowManagerBuilder};
pub use models::{
    DagEntry, ExecutableTask, RunId, RunInfo, RunnableTask, StartedTask, Task, TaskDetails,
    TaskExecutionResult, TaskExecutionStatus, TaskId, TaskInfo, TaskMode, TaskType,
    SPECIAL_META_KEY,
};
