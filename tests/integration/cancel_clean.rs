//! Cancellation, manual clean, and the auto-cleaner sweep.

use std::sync::Arc;
use std::time::Duration;

use dagq::coordinator::paths;
use dagq::{Coordinator, StandardAutoCleaner, Task, TaskId, TaskType, WorkflowManagerBuilder};

use crate::common::{
    expect_no_event, fast_consumer_config, fast_scheduler_config, recv_event, test_cluster,
    wait_for_run_absent, wait_for_run_complete, RecordingExecutor,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn test_task_type() -> TaskType {
    TaskType::new("test", "1", true)
}

#[tokio::test]
async fn cancel_stops_scheduling_new_tasks() {
    let cluster = test_cluster();
    // Slow tasks so the cancel lands while the first is still running.
    let (executor, mut events) = RecordingExecutor::with_delay(Some(Duration::from_millis(500)));
    let manager = WorkflowManagerBuilder::new(Arc::new(cluster.session()), "cancel-worker")
        .adding_task_executor(executor, 1, test_task_type())
        .with_consumer_config(fast_consumer_config())
        .with_scheduler_config(fast_scheduler_config())
        .build();
    manager.start().await.expect("start");

    // c depends on b depends on a.
    let root = Task::new(TaskId::new("c"), test_task_type()).with_children(vec![
        Task::new(TaskId::new("b"), test_task_type())
            .with_children(vec![Task::new(TaskId::new("a"), test_task_type())]),
    ]);
    let run_id = manager.submit_task(&root).await.expect("submit");

    // Wait for a to begin, then cancel while it is still executing.
    let first = recv_event(&mut events, EVENT_TIMEOUT).await;
    assert_eq!(first.task_id, TaskId::new("a"));
    assert!(manager.cancel_run(&run_id).await.expect("cancel"));

    let info = manager
        .get_run_info(&run_id)
        .await
        .expect("run info")
        .expect("run should exist");
    assert!(info.is_complete());

    // a runs to completion, but b and c are never scheduled.
    expect_no_event(&mut events, Duration::from_secs(2)).await;
    assert!(manager
        .get_task_execution_result(&run_id, &TaskId::new("b"))
        .await
        .expect("query")
        .is_none());

    manager.close().await;
}

#[tokio::test]
async fn cancel_missing_run_returns_false() {
    let cluster = test_cluster();
    let (executor, _events) = RecordingExecutor::new();
    let manager = WorkflowManagerBuilder::new(Arc::new(cluster.session()), "cancel-worker")
        .adding_task_executor(executor, 1, test_task_type())
        .with_scheduler_config(fast_scheduler_config())
        .build();
    manager.start().await.expect("start");

    assert!(!manager
        .cancel_run(&dagq::RunId::new("no-such-run"))
        .await
        .expect("cancel"));

    manager.close().await;
}

#[tokio::test]
async fn clean_removes_every_record_of_the_run() {
    let cluster = test_cluster();
    let (executor, mut events) = RecordingExecutor::new();
    let manager = WorkflowManagerBuilder::new(Arc::new(cluster.session()), "clean-worker")
        .adding_task_executor(executor, 1, test_task_type())
        .with_consumer_config(fast_consumer_config())
        .with_scheduler_config(fast_scheduler_config())
        .build();
    manager.start().await.expect("start");

    let task_id = TaskId::new("only");
    let task = Task::new(task_id.clone(), test_task_type());
    let run_id = manager.submit_task(&task).await.expect("submit");

    recv_event(&mut events, EVENT_TIMEOUT).await;
    wait_for_run_complete(&manager, &run_id, EVENT_TIMEOUT).await;

    assert!(manager.clean(&run_id).await.expect("clean"));

    let session = cluster.session();
    assert!(!session
        .exists(&paths::run_path(&run_id))
        .await
        .expect("exists"));
    assert!(!session
        .exists(&paths::started_task_path(&run_id, &task_id))
        .await
        .expect("exists"));
    assert!(!session
        .exists(&paths::completed_task_path(&run_id, &task_id))
        .await
        .expect("exists"));
    assert!(!session
        .exists(&paths::queued_task_path(&run_id, &task_id))
        .await
        .expect("exists"));

    assert!(manager.get_run_info(&run_id).await.expect("info").is_none());
    // A second clean reports the run absent.
    assert!(!manager.clean(&run_id).await.expect("clean again"));

    manager.close().await;
}

#[tokio::test]
async fn auto_cleaner_sweeps_old_completed_runs() {
    let cluster = test_cluster();
    let (executor, mut events) = RecordingExecutor::new();
    let manager = WorkflowManagerBuilder::new(Arc::new(cluster.session()), "sweep-worker")
        .adding_task_executor(executor, 1, test_task_type())
        .with_consumer_config(fast_consumer_config())
        .with_scheduler_config(fast_scheduler_config())
        .with_auto_cleaner(
            Arc::new(StandardAutoCleaner::new(chrono::Duration::milliseconds(100))),
            Duration::from_millis(200),
        )
        .build();
    manager.start().await.expect("start");

    let task_id = TaskId::new("only");
    let task = Task::new(task_id.clone(), test_task_type());
    let run_id = manager.submit_task(&task).await.expect("submit");

    recv_event(&mut events, EVENT_TIMEOUT).await;
    wait_for_run_complete(&manager, &run_id, EVENT_TIMEOUT).await;

    // The leader's sweep removes the run once it is old enough.
    wait_for_run_absent(&manager, &run_id, Duration::from_secs(10)).await;

    let session = cluster.session();
    assert!(!session
        .exists(&paths::started_task_path(&run_id, &task_id))
        .await
        .expect("exists"));
    assert!(!session
        .exists(&paths::completed_task_path(&run_id, &task_id))
        .await
        .expect("exists"));

    manager.close().await;
}
