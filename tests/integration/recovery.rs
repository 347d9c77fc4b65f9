//! Crash-recovery behavior: marker re-enqueue on leadership change,
//! completion-record short-circuiting, and lock release when a worker
//! dies mid-task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dagq::coordinator::paths;
use dagq::{
    Coordinator, CreateMode, DagEntry, ExecutableTask, RunId, RunnableTask, TaskExecutionResult,
    TaskExecutionStatus, TaskId, TaskType, WorkflowManagerBuilder,
};

use crate::common::{
    expect_no_event, fast_consumer_config, fast_scheduler_config, recv_event, test_cluster,
    wait_for_run_complete, RecordingExecutor, StallingExecutor,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn test_task_type() -> TaskType {
    TaskType::new("test", "1", true)
}

/// Writes a single-task run record directly, as the submission path
/// would, so tests can stage coordinator state that predates the
/// manager under test.
async fn stage_single_task_run(session: &dyn Coordinator, run_id: &RunId, task_id: &TaskId) {
    let task = ExecutableTask {
        run_id: run_id.clone(),
        task_id: task_id.clone(),
        task_type: test_task_type(),
        metadata: BTreeMap::new(),
        executable: true,
    };
    let mut tasks = BTreeMap::new();
    tasks.insert(task_id.clone(), task);
    let runnable = RunnableTask {
        tasks,
        entries: vec![DagEntry {
            task_id: task_id.clone(),
            dependencies: Vec::new(),
        }],
        start_time_utc: Utc::now(),
        completion_time_utc: None,
        parent_run_id: None,
    };
    session
        .create(
            &paths::run_path(run_id),
            serde_json::to_vec(&runnable).expect("encode run"),
            CreateMode::Persistent,
        )
        .await
        .expect("create run record");
}

#[tokio::test]
async fn marked_but_unqueued_task_is_reenqueued_on_leadership() {
    let cluster = test_cluster();
    let session = cluster.session();

    let run_id = RunId::new("recovery-run");
    let task_id = TaskId::new("a");
    stage_single_task_run(&session, &run_id, &task_id).await;

    // A previous leader crashed after writing the marker but before
    // enqueueing: the marker exists, the queue is empty.
    session
        .create(
            &paths::queued_task_path(&run_id, &task_id),
            Vec::new(),
            CreateMode::Persistent,
        )
        .await
        .expect("create marker");

    let (executor, mut events) = RecordingExecutor::new();
    let manager = WorkflowManagerBuilder::new(Arc::new(cluster.session()), "recovery-worker")
        .adding_task_executor(executor, 1, test_task_type())
        .with_consumer_config(fast_consumer_config())
        .with_scheduler_config(fast_scheduler_config())
        .build();
    manager.start().await.expect("start");

    // Only the new leader's recovery pass can make this task run: the
    // scan loop itself skips marked tasks.
    let event = recv_event(&mut events, EVENT_TIMEOUT).await;
    assert_eq!(event.task_id, task_id);
    wait_for_run_complete(&manager, &run_id, EVENT_TIMEOUT).await;

    manager.close().await;
}

#[tokio::test]
async fn existing_completion_record_short_circuits_execution() {
    let cluster = test_cluster();
    let session = cluster.session();

    let run_id = RunId::new("restart-run");
    let task_id = TaskId::new("a");
    stage_single_task_run(&session, &run_id, &task_id).await;

    // The task already completed before the restart.
    session
        .create(
            &paths::queued_task_path(&run_id, &task_id),
            Vec::new(),
            CreateMode::Persistent,
        )
        .await
        .expect("create marker");
    let result = TaskExecutionResult::new(TaskExecutionStatus::Success, "pre-restart");
    session
        .create(
            &paths::completed_task_path(&run_id, &task_id),
            serde_json::to_vec(&result).expect("encode result"),
            CreateMode::Persistent,
        )
        .await
        .expect("create completion record");

    let (executor, mut events) = RecordingExecutor::new();
    let manager = WorkflowManagerBuilder::new(Arc::new(cluster.session()), "restart-worker")
        .adding_task_executor(executor, 1, test_task_type())
        .with_consumer_config(fast_consumer_config())
        .with_scheduler_config(fast_scheduler_config())
        .build();
    manager.start().await.expect("start");

    // The run completes off the existing record without re-executing.
    wait_for_run_complete(&manager, &run_id, EVENT_TIMEOUT).await;
    expect_no_event(&mut events, Duration::from_millis(500)).await;

    // The original result survived.
    let stored = manager
        .get_task_execution_result(&run_id, &task_id)
        .await
        .expect("query")
        .expect("result should exist");
    assert_eq!(stored.message, "pre-restart");

    manager.close().await;
}

#[tokio::test]
async fn entry_locked_by_dead_worker_is_redispensed() {
    let cluster = test_cluster();

    // Worker one stalls forever inside the executor.
    let stalled_session = cluster.session();
    let (stalling, mut stall_events) = StallingExecutor::new();
    let stalled_manager =
        WorkflowManagerBuilder::new(Arc::new(stalled_session.clone()), "stalled-worker")
            .adding_task_executor(stalling, 1, test_task_type())
            .with_consumer_config(fast_consumer_config())
            .with_scheduler_config(fast_scheduler_config())
            .build();
    stalled_manager.start().await.expect("start stalled manager");

    let task = dagq::Task::new(TaskId::new("contested"), test_task_type());
    let run_id = stalled_manager.submit_task(&task).await.expect("submit");

    // The stalled worker claimed the entry and is now stuck in it.
    let event = recv_event(&mut stall_events, EVENT_TIMEOUT).await;
    assert_eq!(event.task_id, TaskId::new("contested"));

    // Kill its session: the entry's ephemeral lock vanishes.
    stalled_session.expire();

    // A healthy worker picks the entry up and finishes the run.
    let (executor, mut events) = RecordingExecutor::new();
    let healthy_manager =
        WorkflowManagerBuilder::new(Arc::new(cluster.session()), "healthy-worker")
            .adding_task_executor(executor, 1, test_task_type())
            .with_consumer_config(fast_consumer_config())
            .with_scheduler_config(fast_scheduler_config())
            .build();
    healthy_manager.start().await.expect("start healthy manager");

    let event = recv_event(&mut events, EVENT_TIMEOUT).await;
    assert_eq!(event.task_id, TaskId::new("contested"));
    wait_for_run_complete(&healthy_manager, &run_id, EVENT_TIMEOUT).await;

    // Exactly one effective completion. The started record keeps the
    // first claimant's name: the stalled worker wrote it before dying.
    expect_no_event(&mut events, Duration::from_millis(500)).await;
    let infos = healthy_manager.get_task_info(&run_id).await.expect("task info");
    assert_eq!(infos.len(), 1);
    assert!(infos[0].is_complete());
    assert_eq!(infos[0].instance_name.as_deref(), Some("stalled-worker"));

    // The stalled manager is unusable and cannot be closed cleanly;
    // its tasks die with the test runtime.
    healthy_manager.close().await;
}
