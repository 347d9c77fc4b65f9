//! Delay and priority queue semantics, end to end.

use std::sync::Arc;
use std::time::Duration;

use dagq::{Task, TaskId, TaskMode, TaskType, WorkflowHooks, WorkflowManagerBuilder};
use tokio::sync::mpsc;

use crate::common::{
    fast_consumer_config, fast_scheduler_config, recv_event, test_cluster, wait_for_run_complete,
    RecordingExecutor,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn delayed_task_waits_for_its_delivery_time() {
    const DELAY_MS: i64 = 2000;

    let cluster = test_cluster();
    let task_type = TaskType::new("delayed", "1", true).with_mode(TaskMode::Delay);
    let (executor, mut events) = RecordingExecutor::new();
    let manager = WorkflowManagerBuilder::new(Arc::new(cluster.session()), "delay-worker")
        .adding_task_executor(executor, 2, task_type.clone())
        .with_consumer_config(fast_consumer_config())
        .with_scheduler_config(fast_scheduler_config())
        .build();
    manager.start().await.expect("start");

    // No special meta: dispensable immediately.
    let start_ms = chrono::Utc::now().timestamp_millis();
    let immediate = Task::new(TaskId::new("immediate"), task_type.clone());
    manager.submit_task(&immediate).await.expect("submit");

    let event = recv_event(&mut events, EVENT_TIMEOUT).await;
    assert_eq!(event.task_id, TaskId::new("immediate"));
    assert!(
        event.at_ms < start_ms + DELAY_MS,
        "immediate task should run well before the delay window"
    );

    // Future-dated special meta: held back until the delivery time.
    let start_ms = chrono::Utc::now().timestamp_millis();
    let delayed = Task::new(TaskId::new("delayed"), task_type.clone())
        .with_special_meta(start_ms + DELAY_MS);
    let run_id = manager.submit_task(&delayed).await.expect("submit");

    let event = recv_event(&mut events, EVENT_TIMEOUT).await;
    assert_eq!(event.task_id, TaskId::new("delayed"));
    assert!(
        event.at_ms >= start_ms + DELAY_MS,
        "delayed task ran {}ms early",
        start_ms + DELAY_MS - event.at_ms
    );

    wait_for_run_complete(&manager, &run_id, EVENT_TIMEOUT).await;
    manager.close().await;
}

#[tokio::test]
async fn past_delivery_time_dispenses_immediately() {
    let cluster = test_cluster();
    let task_type = TaskType::new("overdue", "1", true).with_mode(TaskMode::Delay);
    let (executor, mut events) = RecordingExecutor::new();
    let manager = WorkflowManagerBuilder::new(Arc::new(cluster.session()), "delay-worker")
        .adding_task_executor(executor, 1, task_type.clone())
        .with_consumer_config(fast_consumer_config())
        .with_scheduler_config(fast_scheduler_config())
        .build();
    manager.start().await.expect("start");

    let overdue = Task::new(TaskId::new("overdue"), task_type.clone())
        .with_special_meta(chrono::Utc::now().timestamp_millis() - 5000);
    let run_id = manager.submit_task(&overdue).await.expect("submit");

    let event = recv_event(&mut events, EVENT_TIMEOUT).await;
    assert_eq!(event.task_id, TaskId::new("overdue"));

    wait_for_run_complete(&manager, &run_id, EVENT_TIMEOUT).await;
    manager.close().await;
}

#[tokio::test]
async fn priority_queue_dispenses_smallest_priority_first() {
    let cluster = test_cluster();
    let task_type = TaskType::new("ranked", "1", true).with_mode(TaskMode::Priority);

    // Count enqueues through the scheduler hook so every task is
    // durably queued before any consumer starts.
    let (queued_tx, mut queued_rx) = mpsc::unbounded_channel::<()>();
    let hooks = WorkflowHooks::new().with_task_queued(move |_, _| {
        let _ = queued_tx.send(());
    });

    let (executor, mut events) = RecordingExecutor::with_delay(Some(Duration::from_millis(20)));
    let manager = WorkflowManagerBuilder::new(Arc::new(cluster.session()), "priority-worker")
        .adding_task_executor(executor, 1, task_type.clone())
        .with_consumer_config(fast_consumer_config())
        .with_scheduler_config(fast_scheduler_config())
        .with_hooks(hooks)
        .with_deferred_consumers()
        .build();
    manager.start().await.expect("start");

    let priorities = [("1", 1), ("2", 10), ("3", 5), ("4", 30), ("5", 20)];
    let mut run_ids = Vec::new();
    for (id, priority) in priorities {
        let task = Task::new(TaskId::new(id), task_type.clone()).with_special_meta(priority);
        run_ids.push(manager.submit_task(&task).await.expect("submit"));
    }

    for _ in 0..priorities.len() {
        tokio::time::timeout(EVENT_TIMEOUT, queued_rx.recv())
            .await
            .expect("timed out waiting for enqueue")
            .expect("hook channel closed");
    }

    // Everything is queued; now let the single consumer drain it.
    manager.start_task_consumers().await.expect("start consumers");

    for expected in ["1", "3", "2", "5", "4"] {
        let event = recv_event(&mut events, EVENT_TIMEOUT).await;
        assert_eq!(event.task_id, TaskId::new(expected));
    }

    for run_id in &run_ids {
        wait_for_run_complete(&manager, run_id, EVENT_TIMEOUT).await;
    }
    manager.close().await;
}
