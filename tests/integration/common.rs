//! Shared test harness: fast loop configs, recording executors, and
//! completion polling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dagq::{
    ConsumerConfig, ExecutableTask, MemoryCluster, PollingStrategy, RunId, RunInfo,
    SchedulerConfig, TaskExecutor, TaskExecutionResult, TaskExecutionStatus, TaskId,
    WorkflowManager,
};
use tokio::sync::mpsc;

/// Creates a fresh in-process cluster, installing the test tracing
/// subscriber on first use so `RUST_LOG` reveals engine internals.
pub fn test_cluster() -> MemoryCluster {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    MemoryCluster::new()
}

/// One executor invocation, as observed by a test.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub run_id: RunId,
    pub task_id: TaskId,
    /// Wall-clock millis when the executor was entered.
    pub at_ms: i64,
}

/// Executor that reports every invocation on a channel, optionally
/// simulating work with a sleep before returning success.
pub struct RecordingExecutor {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
    work_delay: Option<Duration>,
}

impl RecordingExecutor {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ExecutionEvent>) {
        Self::with_delay(None)
    }

    pub fn with_delay(
        work_delay: Option<Duration>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, work_delay }), rx)
    }
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(&self, task: ExecutableTask) -> TaskExecutionResult {
        let _ = self.tx.send(ExecutionEvent {
            run_id: task.run_id.clone(),
            task_id: task.task_id.clone(),
            at_ms: chrono::Utc::now().timestamp_millis(),
        });
        if let Some(delay) = self.work_delay {
            tokio::time::sleep(delay).await;
        }
        TaskExecutionResult::new(TaskExecutionStatus::Success, "ok")
    }
}

/// Executor that reports its invocation and then never returns,
/// simulating a worker stuck mid-task.
pub struct StallingExecutor {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl StallingExecutor {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl TaskExecutor for StallingExecutor {
    async fn execute(&self, task: ExecutableTask) -> TaskExecutionResult {
        let _ = self.tx.send(ExecutionEvent {
            run_id: task.run_id.clone(),
            task_id: task.task_id.clone(),
            at_ms: chrono::Utc::now().timestamp_millis(),
        });
        std::future::pending::<()>().await;
        unreachable!("pending future never resolves")
    }
}

/// Scheduler config tuned for test latency.
pub fn fast_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        scan_interval: Duration::from_millis(100),
        error_backoff: Duration::from_millis(200),
    }
}

/// Consumer config tuned for test latency.
pub fn fast_consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        polling: PollingStrategy::adaptive(20, 200),
    }
}

/// Receives the next execution event, panicking after `timeout`.
pub async fn recv_event(
    rx: &mut mpsc::UnboundedReceiver<ExecutionEvent>,
    timeout: Duration,
) -> ExecutionEvent {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .expect("timed out waiting for an execution event")
        .expect("event channel closed")
}

/// Asserts that no execution event arrives within `window`.
pub async fn expect_no_event(rx: &mut mpsc::UnboundedReceiver<ExecutionEvent>, window: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected execution of task {} in run {}", event.task_id, event.run_id);
    }
}

/// Polls until the run has a completion marker, panicking after
/// `timeout`.
pub async fn wait_for_run_complete(
    manager: &WorkflowManager,
    run_id: &RunId,
    timeout: Duration,
) -> RunInfo {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let info = manager
            .get_run_info(run_id)
            .await
            .expect("get_run_info should succeed");
        if let Some(info) = info {
            if info.is_complete() {
                return info;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} did not complete within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Polls until the run record is gone, panicking after `timeout`.
pub async fn wait_for_run_absent(manager: &WorkflowManager, run_id: &RunId, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if manager
            .get_run_info(run_id)
            .await
            .expect("get_run_info should succeed")
            .is_none()
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} was not cleaned within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
