//! End-to-end tests for TaskManager against the in-memory document store
//!
//! Run with: cargo test -p taskforge --test task_manager_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, Notify};

use taskforge::monitoring::FailureKind;
use taskforge::persistence::{DocumentStore, InMemoryDocumentStore, ScheduleRequest};
use taskforge::{
    EphemeralError, EphemeralSettings, EphemeralTask, Interval, PollerState, RetryPolicy,
    RunOutcome, StoreError, TaskCost, TaskDefinition, TaskEvent, TaskManager, TaskManagerConfig,
    TaskManagerError, TaskRunError, TaskRunResult, TaskStatus, TaskTypeRegistry,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn config(owner: &str) -> TaskManagerConfig {
    TaskManagerConfig::new(owner)
        .with_poll_interval(Duration::from_millis(20))
        .with_max_poll_interval(Duration::from_millis(200))
        .with_shutdown_timeout(Duration::from_secs(2))
}

fn echo() -> TaskDefinition {
    TaskDefinition::from_fn("echo", |ctx| async move {
        Ok(TaskRunResult::done().with_output(ctx.params.clone()))
    })
}

fn manager_with(
    config: TaskManagerConfig,
    store: &Arc<InMemoryDocumentStore>,
    definitions: Vec<TaskDefinition>,
) -> TaskManager {
    let mut registry = TaskTypeRegistry::new();
    for definition in definitions {
        registry.register(definition).unwrap();
    }
    TaskManager::new(config, Arc::clone(store) as Arc<dyn DocumentStore>, registry).unwrap()
}

/// Wait for the first event matching `pred`
async fn next_event<F>(events: &mut broadcast::Receiver<TaskEvent>, pred: F) -> TaskEvent
where
    F: Fn(&TaskEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn finished(task_id: &str) -> impl Fn(&TaskEvent) -> bool + '_ {
    move |event| event.task_id() == Some(task_id) && event.outcome().is_some()
}

/// Task type that runs until `release` is notified
fn hog(release: &Arc<Notify>) -> TaskDefinition {
    let release = Arc::clone(release);
    TaskDefinition::from_fn("hog", move |_ctx| {
        let release = Arc::clone(&release);
        async move {
            release.notified().await;
            Ok(TaskRunResult::done())
        }
    })
    .with_cost(TaskCost::NORMAL)
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[test_log::test(tokio::test)]
async fn test_one_shot_task_runs_and_is_removed() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let manager = manager_with(config("node-1"), &store, vec![echo()]);
    let mut events = manager.subscribe();
    manager.start().unwrap();

    let task = manager
        .schedule(ScheduleRequest::new("echo", json!({"n": 1})))
        .await
        .unwrap();

    next_event(&mut events, |e| {
        matches!(e, TaskEvent::TaskClaimed { task_id, owner_id, .. }
            if task_id == &task.id && owner_id == "node-1")
    })
    .await;
    let event = next_event(&mut events, finished(&task.id)).await;
    assert_eq!(
        event.outcome(),
        Some(RunOutcome::Succeeded {
            output: Some(json!({"n": 1}))
        })
    );

    assert!(matches!(
        manager.get(&task.id).await,
        Err(TaskManagerError::Store(StoreError::NotFound(_)))
    ));
    assert!(store.is_empty());

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_recurring_task_is_rescheduled() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let manager = manager_with(config("node-1"), &store, vec![echo()]);
    let mut events = manager.subscribe();
    manager.start().unwrap();

    let before = Utc::now();
    let task = manager
        .schedule(ScheduleRequest::new("echo", json!({})).with_interval(Interval::from_mins(5)))
        .await
        .unwrap();
    next_event(&mut events, finished(&task.id)).await;

    let stored = manager.get(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Idle);
    assert_eq!(stored.owner_id, None);
    assert_eq!(stored.retry_at, None);
    assert_eq!(stored.attempts, 1);
    assert!(stored.run_at >= before + chrono::Duration::minutes(5) - chrono::Duration::seconds(1));
    assert!(stored.run_at <= Utc::now() + chrono::Duration::minutes(5));

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_two_managers_never_run_a_task_twice() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let runs: Arc<Mutex<HashMap<String, u32>>> = Arc::default();

    let counting = |runs: Arc<Mutex<HashMap<String, u32>>>| {
        TaskDefinition::from_fn("count", move |ctx| {
            let runs = Arc::clone(&runs);
            async move {
                *runs.lock().entry(ctx.task_id.clone()).or_default() += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(TaskRunResult::done())
            }
        })
        .with_cost(TaskCost::TINY)
    };

    let first = manager_with(config("node-1"), &store, vec![counting(Arc::clone(&runs))]);
    let second = manager_with(config("node-2"), &store, vec![counting(Arc::clone(&runs))]);

    for i in 0..30 {
        first
            .schedule(ScheduleRequest::new("count", json!({ "i": i })))
            .await
            .unwrap();
    }

    first.start().unwrap();
    second.start().unwrap();

    wait_until(|| store.is_empty()).await;
    // Let any duplicate run that slipped through surface
    tokio::time::sleep(Duration::from_millis(100)).await;

    let runs = runs.lock();
    assert_eq!(runs.len(), 30);
    assert!(runs.values().all(|&count| count == 1), "{runs:?}");
    drop(runs);

    first.shutdown().await;
    second.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_running_cost_stays_within_capacity() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let current = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let done = Arc::new(AtomicU32::new(0));

    let definition = {
        let (current, peak, done) = (Arc::clone(&current), Arc::clone(&peak), Arc::clone(&done));
        TaskDefinition::from_fn("tracked", move |_ctx| {
            let (current, peak, done) = (Arc::clone(&current), Arc::clone(&peak), Arc::clone(&done));
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(TaskRunResult::done())
            }
        })
        .with_cost(TaskCost::NORMAL)
    };

    let manager = manager_with(
        config("node-1").with_capacity(4).with_min_capacity(2),
        &store,
        vec![definition],
    );
    for i in 0..10 {
        manager
            .schedule(ScheduleRequest::new("tracked", json!({ "i": i })))
            .await
            .unwrap();
    }
    manager.start().unwrap();

    wait_until(|| done.load(Ordering::SeqCst) == 10).await;
    // Capacity 4 with cost 2 allows two concurrent runs
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_timed_out_run_releases_its_slot() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let slow = TaskDefinition::from_fn("slow", |ctx| async move {
        ctx.cancelled().await;
        Err(TaskRunError::retryable("cancelled"))
    })
    .with_timeout(Duration::from_millis(50));

    // One slot: the echo task can only start once the slow one gives its slot back
    let manager = manager_with(
        config("node-1").with_capacity(2).with_min_capacity(1),
        &store,
        vec![slow, echo()],
    );
    let mut events = manager.subscribe();

    let stuck = manager
        .schedule(
            ScheduleRequest::new("slow", json!({}))
                .with_run_at(Utc::now() - chrono::Duration::seconds(1)),
        )
        .await
        .unwrap();
    let next = manager
        .schedule(ScheduleRequest::new("echo", json!({"after": "timeout"})))
        .await
        .unwrap();
    manager.start().unwrap();

    let timed_out = next_event(&mut events, finished(&stuck.id)).await;
    assert!(matches!(
        timed_out,
        TaskEvent::TaskRunTimedOut {
            timeout_ms: 50,
            will_retry: false,
            ..
        }
    ));
    let succeeded = next_event(&mut events, finished(&next.id)).await;
    assert!(succeeded.outcome().is_some_and(|o| o.is_success()));

    let stored = manager.get(&stuck.id).await.unwrap();
    assert!(stored.is_terminal());
    assert!(stored.last_error.unwrap().contains("timed out"));

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_failures_retry_until_max_attempts() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let flaky = TaskDefinition::from_fn("flaky", |_ctx| async move {
        Err(TaskRunError::retryable("upstream unavailable"))
    })
    .with_max_attempts(2)
    .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(10)));

    let manager = manager_with(config("node-1"), &store, vec![flaky]);
    let mut events = manager.subscribe();
    manager.start().unwrap();

    let task = manager
        .schedule(ScheduleRequest::new("flaky", json!({})))
        .await
        .unwrap();

    let first = next_event(&mut events, finished(&task.id)).await;
    assert!(matches!(
        first,
        TaskEvent::TaskRunFailed {
            will_retry: true,
            kind: FailureKind::Run,
            ..
        }
    ));
    let second = next_event(&mut events, finished(&task.id)).await;
    assert!(matches!(
        second,
        TaskEvent::TaskRunFailed {
            will_retry: false,
            ..
        }
    ));

    let stored = manager.get(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.retry_at, None);
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.failures, 2);
    assert_eq!(stored.last_error.as_deref(), Some("upstream unavailable"));

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_ensure_scheduled_is_idempotent() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let manager = manager_with(config("node-1"), &store, vec![echo()]);

    let first = manager
        .ensure_scheduled(ScheduleRequest::new("echo", json!({"a": 1, "b": 2})))
        .await
        .unwrap();
    let second = manager
        .ensure_scheduled(ScheduleRequest::new("echo", json!({"b": 2, "a": 1})))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(store.len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_search_failures_back_off_then_recover() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let manager = manager_with(config("node-1"), &store, vec![echo()]);
    let mut cycles = manager.subscribe();
    let mut runs = manager.subscribe();

    let task = manager
        .schedule(ScheduleRequest::new("echo", json!({})))
        .await
        .unwrap();
    store.fail_next_searches(3);
    manager.start().unwrap();

    for _ in 0..3 {
        next_event(&mut cycles, |e| matches!(e, TaskEvent::PollCycleFailed { .. })).await;
    }
    let snapshot = manager.managed_snapshot();
    assert_eq!(snapshot.consecutive_errors, 3);
    assert_eq!(snapshot.poll_interval, Duration::from_millis(160));
    assert_eq!(snapshot.capacity, 16);

    // The loop survives and the queued task still runs
    next_event(&mut cycles, |e| matches!(e, TaskEvent::PollCycleCompleted { .. })).await;
    assert_eq!(manager.managed_snapshot().consecutive_errors, 0);
    next_event(&mut runs, finished(&task.id)).await;
    assert_eq!(manager.poller_state(), PollerState::Polling);

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_ephemeral_run_and_rejections() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let enabled = EphemeralSettings {
        enabled: true,
        queue_capacity: 4,
        capacity: 4,
    };
    let manager = manager_with(
        config("node-1").with_ephemeral(enabled),
        &store,
        vec![echo()],
    );
    manager.start().unwrap();

    let handle = manager
        .ephemeral_run_now(EphemeralTask::new("echo", json!({"now": true})))
        .unwrap();
    let outcome = tokio::time::timeout(EVENT_TIMEOUT, handle.outcome())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Succeeded {
            output: Some(json!({"now": true}))
        }
    );
    assert!(store.is_empty());

    assert_eq!(
        manager
            .ephemeral_run_now(EphemeralTask::new("missing", json!({})))
            .unwrap_err(),
        EphemeralError::UnknownTaskType("missing".into())
    );

    manager.shutdown().await;
    assert_eq!(
        manager
            .ephemeral_run_now(EphemeralTask::new("echo", json!({})))
            .unwrap_err(),
        EphemeralError::ShuttingDown
    );

    let disabled = manager_with(config("node-2"), &store, vec![echo()]);
    assert_eq!(
        disabled
            .ephemeral_run_now(EphemeralTask::new("echo", json!({})))
            .unwrap_err(),
        EphemeralError::Disabled
    );
}

#[test_log::test(tokio::test)]
async fn test_ephemeral_queue_full() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let settings = EphemeralSettings {
        enabled: true,
        queue_capacity: 2,
        capacity: 4,
    };
    // Not started: nothing drains the queue
    let manager = manager_with(config("node-1").with_ephemeral(settings), &store, vec![echo()]);

    for _ in 0..2 {
        manager
            .ephemeral_run_now(EphemeralTask::new("echo", json!({})))
            .unwrap();
    }
    assert_eq!(
        manager
            .ephemeral_run_now(EphemeralTask::new("echo", json!({})))
            .unwrap_err(),
        EphemeralError::QueueFull { capacity: 2 }
    );
}

#[test_log::test(tokio::test)]
async fn test_run_now_runs_future_task_immediately() {
    let store = Arc::new(InMemoryDocumentStore::new());
    // Long interval so the poller cannot be what runs it
    let manager = manager_with(
        config("node-1")
            .with_poll_interval(Duration::from_secs(30))
            .with_max_poll_interval(Duration::from_secs(60)),
        &store,
        vec![echo()],
    );
    manager.start().unwrap();

    let task = manager
        .schedule(
            ScheduleRequest::new("echo", json!({"report": "daily"}))
                .with_run_at(Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();

    let outcome = tokio::time::timeout(EVENT_TIMEOUT, manager.run_now(&task.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Succeeded {
            output: Some(json!({"report": "daily"}))
        }
    );
    assert!(store.is_empty());

    manager.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_shutdown_waits_for_in_flight_runs() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let definition = TaskDefinition::from_fn("steady", |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(TaskRunResult::done())
    });
    let manager = manager_with(config("node-1"), &store, vec![definition]);
    let mut events = manager.subscribe();
    manager.start().unwrap();

    let task = manager
        .schedule(ScheduleRequest::new("steady", json!({})))
        .await
        .unwrap();
    next_event(&mut events, |e| {
        matches!(e, TaskEvent::TaskClaimed { task_id, .. } if task_id == &task.id)
    })
    .await;

    manager.shutdown().await;
    assert_eq!(manager.poller_state(), PollerState::Stopped);

    let mut succeeded = false;
    while let Ok(event) = events.try_recv() {
        if event.task_id() == Some(task.id.as_str()) && event.outcome().is_some() {
            succeeded = event.outcome().is_some_and(|o| o.is_success());
        }
    }
    assert!(succeeded);
    assert!(store.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_queued_ephemeral_work_is_dropped_at_shutdown() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let settings = EphemeralSettings {
        enabled: true,
        queue_capacity: 4,
        capacity: 2,
    };
    let steady = TaskDefinition::from_fn("steady", |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(TaskRunResult::done())
    })
    .with_cost(TaskCost::NORMAL);
    let manager = manager_with(config("node-1").with_ephemeral(settings), &store, vec![steady]);
    let mut events = manager.subscribe();
    manager.start().unwrap();

    let running = manager
        .ephemeral_run_now(EphemeralTask::new("steady", json!({})))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Waits behind the first run for the lane's only slot
    let queued = manager
        .ephemeral_run_now(EphemeralTask::new("steady", json!({})))
        .unwrap();
    let queued_id = queued.id().to_string();
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.shutdown().await;

    assert_eq!(queued.outcome().await, Err(EphemeralError::Dropped));
    assert!(running.outcome().await.unwrap().is_success());

    let mut dropped = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TaskEvent::EphemeralTaskDropped { task_id, .. } = event {
            dropped.push(task_id);
        }
    }
    assert_eq!(dropped, vec![queued_id]);
}

#[test_log::test(tokio::test)]
async fn test_run_now_claims_locally_while_a_peer_polls() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let release = Arc::new(Notify::new());
    let node_a = Arc::new(manager_with(
        config("node-a").with_capacity(2).with_min_capacity(1),
        &store,
        vec![echo(), hog(&release)],
    ));
    let node_b = manager_with(config("node-b"), &store, vec![echo(), hog(&release)]);
    let mut a_events = node_a.subscribe();
    let mut b_events = node_b.subscribe();
    node_a.start().unwrap();

    // Fill node-a's capacity before node-b is around to take anything
    let hogging = node_a
        .schedule(ScheduleRequest::new("hog", json!({})))
        .await
        .unwrap();
    next_event(&mut a_events, |e| {
        matches!(e, TaskEvent::TaskClaimed { task_id, .. } if task_id == &hogging.id)
    })
    .await;
    node_b.start().unwrap();

    let task = node_a
        .schedule(
            ScheduleRequest::new("echo", json!({"on": "node-a"}))
                .with_run_at(Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();
    let run = tokio::spawn({
        let node_a = Arc::clone(&node_a);
        let id = task.id.clone();
        async move { node_a.run_now(&id).await }
    });

    // node-b keeps polling but the task never becomes due for it
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!run.is_finished());
    assert_eq!(node_a.get(&task.id).await.unwrap().status, TaskStatus::Idle);

    release.notify_one();
    let outcome = tokio::time::timeout(EVENT_TIMEOUT, run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Succeeded {
            output: Some(json!({"on": "node-a"}))
        }
    );

    while let Ok(event) = b_events.try_recv() {
        assert_ne!(event.task_id(), Some(task.id.as_str()));
    }

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_run_now_reports_task_claimed_elsewhere() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let release = Arc::new(Notify::new());
    let node_a = Arc::new(manager_with(
        config("node-a").with_capacity(2).with_min_capacity(1),
        &store,
        vec![echo(), hog(&release)],
    ));
    let node_b = manager_with(config("node-b"), &store, vec![echo(), hog(&release)]);
    let mut a_events = node_a.subscribe();
    let mut b_events = node_b.subscribe();
    node_a.start().unwrap();

    let hogging = node_a
        .schedule(ScheduleRequest::new("hog", json!({})))
        .await
        .unwrap();
    next_event(&mut a_events, |e| {
        matches!(e, TaskEvent::TaskClaimed { task_id, .. } if task_id == &hogging.id)
    })
    .await;

    // Due now, but node-a has no room to claim it
    let task = node_a
        .schedule(ScheduleRequest::new("echo", json!({})))
        .await
        .unwrap();
    let run = tokio::spawn({
        let node_a = Arc::clone(&node_a);
        let id = task.id.clone();
        async move { node_a.run_now(&id).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run.is_finished());

    node_b.start().unwrap();
    next_event(&mut b_events, finished(&task.id)).await;

    release.notify_one();
    let result = tokio::time::timeout(EVENT_TIMEOUT, run)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(TaskManagerError::RunClaimedElsewhere(ref id)) if id == &task.id
    ));

    node_a.shutdown().await;
    node_b.shutdown().await;
}
