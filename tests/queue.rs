//! Queue scenarios: strict priority order, retry-then-dead-letter, and
//! dead-letter auto-retry.

mod common;

use chrono::Utc;
use common::{fake_factory, tenant_a};
use redgate::{
    DeadLetterQueue, DlqCategory, DlqFilter, EnqueueOutcome, FailOutcome, QueueConfig, Task,
    TaskError, TaskKind, TaskPriority, TaskQueue, TaskState,
};
use redgate_connection::fake::FakeStore;
use std::sync::Arc;
use std::time::Duration;

async fn queue_and_dlq(store: &FakeStore) -> (TaskQueue, DeadLetterQueue) {
    let factory = fake_factory(store).await;
    (
        TaskQueue::new(Arc::clone(&factory), QueueConfig::default()),
        DeadLetterQueue::new(factory),
    )
}

fn task(priority: TaskPriority) -> Task {
    Task::builder(TaskKind::AgentTask, tenant_a())
        .priority(priority)
        .build()
        .unwrap()
}

#[tokio::test]
async fn dequeue_returns_urgent_critical_high_normal_low() {
    let store = FakeStore::new();
    let (queue, _) = queue_and_dlq(&store).await;

    let a = task(TaskPriority::Low);
    let b = task(TaskPriority::Urgent);
    let c = task(TaskPriority::Normal);
    let d = task(TaskPriority::Critical);
    let e = task(TaskPriority::High);
    for t in [&a, &b, &c, &d, &e] {
        assert!(queue.enqueue(t).await.unwrap().is_accepted());
    }

    let mut order = Vec::new();
    while let Some(dequeued) = queue
        .dequeue(TaskKind::AgentTask, &tenant_a(), "w")
        .await
        .unwrap()
    {
        order.push(dequeued.task.task_id);
    }
    assert_eq!(
        order,
        vec![b.task_id, d.task_id, e.task_id, c.task_id, a.task_id]
    );
}

#[tokio::test]
async fn retry_then_dead_letter_walks_the_documented_path() {
    let store = FakeStore::new();
    let (queue, dlq) = queue_and_dlq(&store).await;
    let tenant = tenant_a();

    let x = Task::builder(TaskKind::AgentTask, tenant)
        .max_attempts(2)
        .build()
        .unwrap();
    queue.enqueue(&x).await.unwrap();

    // First attempt fails: status retrying, attempts = 1, back in the
    // queue with a 2 s backoff.
    queue.dequeue(TaskKind::AgentTask, &tenant, "w").await.unwrap();
    let outcome = queue
        .fail(&dlq, &tenant, &x.task_id, "upstream timeout", true)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        FailOutcome::Retrying {
            attempt: 1,
            delay,
            ..
        } if delay == Duration::from_secs(2)
    ));
    let status = queue.status(&tenant, &x.task_id).await.unwrap().unwrap();
    assert_eq!(status.status, TaskState::Retrying);
    assert_eq!(status.attempts, 1);

    // Invisible until the backoff elapses.
    assert!(queue
        .dequeue(TaskKind::AgentTask, &tenant, "w")
        .await
        .unwrap()
        .is_none());
    tokio::time::sleep(Duration::from_millis(2100)).await;

    // Second attempt fails: retries are exhausted, the task is failed
    // and a dead-letter entry exists.
    let second = queue
        .dequeue(TaskKind::AgentTask, &tenant, "w")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.attempt, 2);
    let outcome = queue
        .fail(&dlq, &tenant, &x.task_id, "upstream timeout", true)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FailOutcome::DeadLettered {
            category: DlqCategory::RetryExhausted
        }
    );

    let status = queue.status(&tenant, &x.task_id).await.unwrap().unwrap();
    assert_eq!(status.status, TaskState::Failed);
    assert_eq!(status.attempts, 2);

    let entry = dlq.get(&tenant, &x.task_id).await.unwrap().unwrap();
    assert_eq!(entry.category, DlqCategory::RetryExhausted);
    assert_eq!(entry.attempts, 2);

    // The entry sits at the documented logical key under the tenant.
    let raw = fake_factory(&store)
        .await
        .with_admin_connection(|conn| async move {
            conn.scan_match("proj:*:dead_letter_queue:task:*").await
        })
        .await
        .unwrap();
    assert_eq!(
        raw,
        vec![format!("proj:{tenant}:dead_letter_queue:task:{}", x.task_id)]
    );
}

#[tokio::test]
async fn past_schedule_is_rejected_at_construction() {
    let result = Task::builder(TaskKind::AgentTask, tenant_a())
        .scheduled_at(Utc::now() - chrono::Duration::seconds(30))
        .build();
    assert!(matches!(result, Err(TaskError::ScheduledInPast)));
}

#[tokio::test]
async fn attempts_never_exceed_max_attempts_outside_the_dlq() {
    let store = FakeStore::new();
    let (queue, dlq) = queue_and_dlq(&store).await;
    let tenant = tenant_a();

    let x = Task::builder(TaskKind::AgentTask, tenant)
        .max_attempts(2)
        .build()
        .unwrap();
    queue.enqueue(&x).await.unwrap();

    for round in 0..2 {
        // Backoff doubles each round (2^attempts).
        if round > 0 {
            tokio::time::sleep(Duration::from_millis(2100)).await;
        }
        let dequeued = queue
            .dequeue(TaskKind::AgentTask, &tenant, "w")
            .await
            .unwrap()
            .unwrap();
        assert!(dequeued.attempt <= x.max_attempts);
        queue
            .fail(&dlq, &tenant, &x.task_id, "connection reset", true)
            .await
            .unwrap();
    }

    // Nothing left to dequeue; the task lives in the dead-letter store.
    assert!(queue
        .dequeue(TaskKind::AgentTask, &tenant, "w")
        .await
        .unwrap()
        .is_none());
    assert!(dlq.get(&tenant, &x.task_id).await.unwrap().is_some());
}

#[tokio::test]
async fn dlq_listing_and_statistics() {
    let store = FakeStore::new();
    let (queue, dlq) = queue_and_dlq(&store).await;
    let tenant = tenant_a();

    for _ in 0..3 {
        let t = Task::builder(TaskKind::AgentTask, tenant)
            .max_attempts(1)
            .build()
            .unwrap();
        queue.enqueue(&t).await.unwrap();
        queue.dequeue(TaskKind::AgentTask, &tenant, "w").await.unwrap();
        queue
            .fail(&dlq, &tenant, &t.task_id, "bad payload shape", false)
            .await
            .unwrap();
    }

    let entries = dlq.list(&tenant, &DlqFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 3);

    let filtered = dlq
        .list(
            &tenant,
            &DlqFilter {
                category: Some(DlqCategory::RetryExhausted),
                ..DlqFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(filtered.len(), 3);

    let stats = dlq.statistics(&tenant).await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_category.get("retry_exhausted"), Some(&3));
    // "bad payload shape" matches no transient pattern.
    assert_eq!(stats.auto_retry_eligible, 0);
}

#[tokio::test]
async fn eligible_dead_letters_are_auto_retried() {
    let store = FakeStore::new();
    let (queue, dlq) = queue_and_dlq(&store).await;
    let tenant = tenant_a();

    let t = Task::builder(TaskKind::AgentTask, tenant)
        .max_attempts(1)
        .build()
        .unwrap();
    queue.enqueue(&t).await.unwrap();
    queue.dequeue(TaskKind::AgentTask, &tenant, "w").await.unwrap();
    queue
        .fail(&dlq, &tenant, &t.task_id, "connection refused", true)
        .await
        .unwrap();

    let entry = dlq.get(&tenant, &t.task_id).await.unwrap().unwrap();
    assert!(entry.auto_retry_eligible);

    // The scheduled retry time is in the future; the scan leaves it.
    assert_eq!(dlq.process_auto_retries(&tenant, &queue).await.unwrap(), 0);

    // Manual retry re-injects immediately at Normal priority.
    assert!(dlq
        .retry(&tenant, &t.task_id, &queue, TaskPriority::Normal)
        .await
        .unwrap());
    assert!(dlq.get(&tenant, &t.task_id).await.unwrap().is_none());

    let dequeued = queue
        .dequeue(TaskKind::AgentTask, &tenant, "w")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dequeued.task.task_id, t.task_id);
    assert_eq!(dequeued.task.priority, TaskPriority::Normal);
}

#[tokio::test]
async fn enqueue_denials_are_structured_values() {
    let store = FakeStore::new();
    let factory = fake_factory(&store).await;
    let queue = TaskQueue::new(factory, QueueConfig { max_size: 4 });
    let tenant = tenant_a();

    // The tenant's fairness share is a quarter of the global bound.
    assert!(queue.enqueue(&task(TaskPriority::Normal)).await.unwrap().is_accepted());
    let denied = queue.enqueue(&task(TaskPriority::Normal)).await.unwrap();
    assert!(matches!(denied, EnqueueOutcome::ProjectQueueFull { .. }));
}
