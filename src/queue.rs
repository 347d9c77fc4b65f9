//! Durable per-task-type queues over the coordinator.
//!
//! Each entry is a child node of the type's queue path whose name embeds
//! the priority-or-delay value and a monotonic sequence:
//! `qn-{meta:020}-{seq:010}`. Standard and delay queues dispense in
//! sequence order, holding back entries whose embedded delivery time is
//! in the future; priority queues dispense smallest `(meta, seq)` first,
//! so equal priorities fall back to enqueue order.
//!
//! Dispense exclusivity comes from a per-entry ephemeral lock: whichever
//! consumer creates the lock node runs the callback, and a consumer that
//! dies mid-callback loses its session, the lock vanishes, and the entry
//! becomes dispensable again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tokio::sync::watch;

use crate::config::ConsumerConfig;
use crate::coordinator::{paths, Coordinator, CoordinatorError, CreateMode};
use crate::error::WorkflowResult;
use crate::models::{special_meta_value, ExecutableTask, TaskMode, TaskType};
use crate::serialization::{decode, encode};

const ENTRY_PREFIX: &str = "qn-";
const META_WIDTH: usize = 20;

/// Callback invoked with each dequeued task. Returning `Ok` removes the
/// entry; returning `Err` leaves it in place for another consumer.
#[async_trait]
pub(crate) trait DequeueHandler: Send + Sync {
    async fn handle(&self, task: ExecutableTask) -> WorkflowResult<()>;
}

/// Producer handle for one task-type queue.
#[derive(Clone)]
pub(crate) struct TaskQueue {
    coordinator: Arc<dyn Coordinator>,
    task_type: TaskType,
}

impl TaskQueue {
    pub(crate) fn new(coordinator: Arc<dyn Coordinator>, task_type: TaskType) -> Self {
        Self {
            coordinator,
            task_type,
        }
    }

    /// Appends a task to the queue. The entry name embeds the task's
    /// special-meta value (zero when absent); the coordinator appends
    /// the sequence.
    pub(crate) async fn enqueue(&self, task: &ExecutableTask) -> WorkflowResult<()> {
        let meta = special_meta_value(&task.metadata).unwrap_or(0).max(0);
        #[allow(clippy::cast_sign_loss)]
        let prefix = entry_name_prefix(meta as u64);
        let path = format!("{}/{prefix}", paths::queue_path(&self.task_type));
        let data = encode(task)?;
        self.coordinator
            .create(&path, data, CreateMode::PersistentSequential)
            .await?;
        counter!("dagq.queue.enqueued", "task_type" => self.task_type.name.clone()).increment(1);
        Ok(())
    }
}

fn entry_name_prefix(meta: u64) -> String {
    format!("{}{:0width$}-", ENTRY_PREFIX, meta, width = META_WIDTH)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedEntry {
    name: String,
    meta: u64,
    seq: u64,
}

fn parse_entry_name(name: &str) -> Option<ParsedEntry> {
    let rest = name.strip_prefix(ENTRY_PREFIX)?;
    let meta_str = rest.get(..META_WIDTH)?;
    if rest.get(META_WIDTH..=META_WIDTH)? != "-" {
        return None;
    }
    let seq_str = rest.get(META_WIDTH + 1..)?;
    let meta = meta_str.parse().ok()?;
    let seq = seq_str.parse().ok()?;
    Some(ParsedEntry {
        name: name.to_string(),
        meta,
        seq,
    })
}

/// One consumer attached to a task-type queue. Several consumers (in one
/// or many processes) can share a queue; the per-entry lock keeps each
/// entry with exactly one of them at a time.
pub(crate) struct QueueConsumer {
    coordinator: Arc<dyn Coordinator>,
    task_type: TaskType,
    handler: Arc<dyn DequeueHandler>,
    config: ConsumerConfig,
}

impl QueueConsumer {
    pub(crate) fn new(
        coordinator: Arc<dyn Coordinator>,
        task_type: TaskType,
        handler: Arc<dyn DequeueHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            coordinator,
            task_type,
            handler,
            config,
        }
    }

    /// Runs the consumer loop until shutdown. Wakes on queue child
    /// watches; the bounded poll interval covers delay-mode deliveries.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue_path = paths::queue_path(&self.task_type);
        let mut queue_watch = self.coordinator.watch_children(&queue_path);
        let mut interval = self.config.polling.initial_interval();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.dispense_once().await {
                Ok(true) => {
                    interval = self.config.polling.next_interval(interval, true);
                    continue;
                }
                Ok(false) => {
                    interval = self.config.polling.next_interval(interval, false);
                }
                Err(e) => {
                    tracing::warn!(
                        task_type = %self.task_type.name,
                        error = %e,
                        "Queue consumer pass failed; backing off"
                    );
                    interval = self.config.polling.next_interval(interval, false);
                }
            }

            let sleep_interval = self.config.polling.apply_jitter(interval);
            tokio::select! {
                () = tokio::time::sleep(sleep_interval) => {}
                // Any watch outcome (including lag) is just a wakeup hint.
                _ = queue_watch.recv() => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::debug!(task_type = %self.task_type.name, "Queue consumer stopped");
    }

    /// Attempts to dispense one entry. Returns true if a callback ran to
    /// successful completion.
    async fn dispense_once(&self) -> WorkflowResult<bool> {
        let queue_path = paths::queue_path(&self.task_type);
        let children = self.coordinator.children(&queue_path).await?;

        let mut entries: Vec<ParsedEntry> = children
            .iter()
            .filter_map(|name| parse_entry_name(name))
            .collect();
        match self.task_type.mode {
            TaskMode::Priority => entries.sort_by_key(|e| (e.meta, e.seq)),
            TaskMode::Standard | TaskMode::Delay => entries.sort_by_key(|e| e.seq),
        }

        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        for entry in &entries {
            // In the FIFO modes the meta field is a delivery time.
            if self.task_type.mode != TaskMode::Priority && entry.meta > now_ms {
                continue;
            }
            if self.take_entry(entry).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn take_entry(&self, entry: &ParsedEntry) -> WorkflowResult<bool> {
        let lock_path = paths::queue_lock_path(&self.task_type, &entry.name);
        match self
            .coordinator
            .create(&lock_path, Vec::new(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {}
            Err(CoordinatorError::AlreadyExists { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let entry_path = format!("{}/{}", paths::queue_path(&self.task_type), entry.name);
        let payload = match self.coordinator.get(&entry_path).await {
            Ok(versioned) => versioned.data,
            Err(CoordinatorError::NotFound { .. }) => {
                // A peer consumed the entry between our listing and lock.
                self.best_effort_delete(&lock_path).await;
                return Ok(false);
            }
            Err(e) => {
                self.best_effort_delete(&lock_path).await;
                return Err(e.into());
            }
        };

        let task: ExecutableTask = match decode(&payload) {
            Ok(task) => task,
            Err(e) => {
                // Poison entry: leaving it in place would retry forever.
                tracing::error!(
                    task_type = %self.task_type.name,
                    entry = %entry.name,
                    error = %e,
                    "Removing undecodable queue entry"
                );
                self.best_effort_delete(&entry_path).await;
                self.best_effort_delete(&lock_path).await;
                counter!("dagq.queue.poison", "task_type" => self.task_type.name.clone())
                    .increment(1);
                return Ok(false);
            }
        };

        match self.handler.handle(task).await {
            Ok(()) => {
                self.best_effort_delete(&entry_path).await;
                self.best_effort_delete(&lock_path).await;
                counter!("dagq.queue.dispensed", "task_type" => self.task_type.name.clone())
                    .increment(1);
                Ok(true)
            }
            Err(e) => {
                // Leave the entry for another consumer; drop only our lock.
                tracing::warn!(
                    task_type = %self.task_type.name,
                    entry = %entry.name,
                    error = %e,
                    "Dequeue handler failed; entry left for re-dispense"
                );
                self.best_effort_delete(&lock_path).await;
                Err(e)
            }
        }
    }

    async fn best_effort_delete(&self, path: &str) {
        match self.coordinator.delete(path).await {
            Ok(()) | Err(CoordinatorError::NotFound { .. }) => {}
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Failed to delete queue node");
            }
        }
    }
}
