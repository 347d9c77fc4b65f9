//! Flattens a user task tree into the run record's task map and
//! dependency entries.
//!
//! A task's children are its predecessors, so leaves execute first and
//! the root last. Repeating an identical node under several parents
//! expresses fan-in; two *different* tasks sharing an id are rejected.
//! Entries come out in deterministic topological order with ties broken
//! by task id, which fixes the scheduler's enqueue order for a given
//! DAG.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::models::{DagEntry, Task, TaskId};

/// Errors from DAG construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    /// Two different tasks in one submission share an id.
    #[error("duplicate task id in submission: {task_id}")]
    DuplicateTaskId {
        /// The duplicated id.
        task_id: TaskId,
    },
}

/// A flattened task DAG: every node keyed by id, plus dependency entries
/// in deterministic topological order.
#[derive(Debug, Clone)]
pub(crate) struct FlattenedDag {
    pub(crate) tasks: BTreeMap<TaskId, Task>,
    pub(crate) entries: Vec<DagEntry>,
}

/// Flattens `root` and its descendants, visiting every distinct node
/// exactly once.
pub(crate) fn flatten(root: &Task) -> Result<FlattenedDag, DagError> {
    let mut tasks: BTreeMap<TaskId, Task> = BTreeMap::new();
    let mut dependencies: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();

    let mut stack = vec![root];
    while let Some(task) = stack.pop() {
        match tasks.get(task.task_id()) {
            Some(seen) if seen == task => {
                // Fan-in: the same node reached through another parent.
                continue;
            }
            Some(_) => {
                return Err(DagError::DuplicateTaskId {
                    task_id: task.task_id().clone(),
                });
            }
            None => {
                tasks.insert(task.task_id().clone(), task.clone());
            }
        }

        let deps = dependencies.entry(task.task_id().clone()).or_default();
        for child in task.children() {
            deps.insert(child.task_id().clone());
            stack.push(child);
        }
    }

    let entries = topological_entries(&dependencies);
    Ok(FlattenedDag { tasks, entries })
}

/// Orders the dependency map topologically (predecessors first), ties
/// broken by task id ascending. Kahn's algorithm over a sorted frontier.
fn topological_entries(dependencies: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> Vec<DagEntry> {
    let mut in_degree: BTreeMap<&TaskId, usize> = dependencies
        .iter()
        .map(|(task_id, deps)| (task_id, deps.len()))
        .collect();
    let mut dependents: BTreeMap<&TaskId, Vec<&TaskId>> = BTreeMap::new();
    for (task_id, deps) in dependencies {
        for dep in deps {
            dependents.entry(dep).or_default().push(task_id);
        }
    }

    // BTreeSet keeps the ready frontier sorted by task id.
    let mut frontier: BTreeSet<&TaskId> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&task_id, _)| task_id)
        .collect();

    let mut entries = Vec::with_capacity(dependencies.len());
    while let Some(&task_id) = frontier.iter().next() {
        frontier.remove(task_id);
        entries.push(DagEntry {
            task_id: task_id.clone(),
            dependencies: dependencies[task_id].iter().cloned().collect(),
        });

        if let Some(deps) = dependents.get(task_id) {
            for &dependent in deps {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        frontier.insert(dependent);
                    }
                }
            }
        }
    }

    entries
}
