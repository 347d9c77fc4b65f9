use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// Reserved metadata key carrying the queue-layer priority or delivery
/// time. The value is a decimal integer: epoch millis for
/// [`TaskMode::Delay`], a priority for [`TaskMode::Priority`]. The key is
/// part of the stored record format and must not change.
pub const SPECIAL_META_KEY: &str = "__nirmata_special_meta__";

/// Queue dispense semantics for a task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// FIFO by enqueue order.
    #[default]
    Standard,
    /// Smallest priority value first; enqueue order within a priority.
    Priority,
    /// FIFO, but entries carrying a future delivery time are held back.
    Delay,
}

/// Describes a category of task: which queue it rides and how it is
/// dispensed. Workers register one executor per task type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskType {
    /// Task type name, e.g. `send_email`.
    pub name: String,
    /// Task type version. Different versions use different queues.
    pub version: String,
    /// Whether executions of this type are idempotent. Tasks may be
    /// invoked more than once after crashes; non-idempotent types must
    /// tolerate that themselves.
    pub is_idempotent: bool,
    /// Queue dispense mode.
    pub mode: TaskMode,
}

impl TaskType {
    /// Creates a task type with [`TaskMode::Standard`] dispensing.
    pub fn new(name: impl Into<String>, version: impl Into<String>, is_idempotent: bool) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            is_idempotent,
            mode: TaskMode::Standard,
        }
    }

    /// Sets the queue dispense mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }

    /// The sentinel type carried by structural (non-executable) tasks in
    /// stored records.
    pub(crate) fn null_type() -> Self {
        Self {
            name: String::new(),
            version: String::new(),
            is_idempotent: false,
            mode: TaskMode::Standard,
        }
    }

    /// Returns true if this is the structural-task sentinel.
    #[must_use]
    pub fn is_null_type(&self) -> bool {
        self.name.is_empty() && self.version.is_empty()
    }

    /// Stable `name-version` key used for queue paths.
    pub(crate) fn queue_key(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// A node in a user-submitted task DAG.
///
/// A task's children are its predecessors: every child must complete
/// before the task itself becomes ready. Repeating an identical child
/// node under two parents expresses fan-in. A task without a type is
/// structural: it is never executed, only traversed for its
/// fan-in/fan-out structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    task_id: TaskId,
    task_type: Option<TaskType>,
    metadata: BTreeMap<String, String>,
    children: Vec<Task>,
}

impl Task {
    /// Creates an executable task with no children and no metadata.
    #[must_use]
    pub fn new(task_id: TaskId, task_type: TaskType) -> Self {
        Self {
            task_id,
            task_type: Some(task_type),
            metadata: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Creates a structural (non-executable) grouping task.
    #[must_use]
    pub fn container(task_id: TaskId, children: Vec<Task>) -> Self {
        Self {
            task_id,
            task_type: None,
            metadata: BTreeMap::new(),
            children,
        }
    }

    /// Sets the task's children (its predecessors).
    #[must_use]
    pub fn with_children(mut self, children: Vec<Task>) -> Self {
        self.children = children;
        self
    }

    /// Sets the task's metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the reserved priority-or-delay metadata value.
    #[must_use]
    pub fn with_special_meta(mut self, value: i64) -> Self {
        self.metadata
            .insert(SPECIAL_META_KEY.to_string(), value.to_string());
        self
    }

    /// Builds a metadata map holding only the reserved priority-or-delay
    /// value.
    #[must_use]
    pub fn make_special_meta(value: i64) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert(SPECIAL_META_KEY.to_string(), value.to_string());
        metadata
    }

    /// The task's id.
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// The task's type, or `None` for structural tasks.
    #[must_use]
    pub fn task_type(&self) -> Option<&TaskType> {
        self.task_type.as_ref()
    }

    /// The task's metadata.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// The task's children (predecessors).
    #[must_use]
    pub fn children(&self) -> &[Task] {
        &self.children
    }

    /// Returns true if the task has a type and can be enqueued.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.task_type.is_some()
    }
}

/// Reads the reserved priority-or-delay value from a metadata map.
pub(crate) fn special_meta_value(metadata: &BTreeMap<String, String>) -> Option<i64> {
    metadata.get(SPECIAL_META_KEY)?.parse().ok()
}

/// Returns a copy of the metadata map without the reserved key.
pub(crate) fn strip_special_meta(metadata: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    metadata
        .iter()
        .filter(|(k, _)| k.as_str() != SPECIAL_META_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
