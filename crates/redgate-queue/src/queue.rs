use crate::config::QueueConfig;
use crate::dead_letter::{DeadLetterQueue, DlqCategory, DlqSeverity};
use crate::error::QueueError;
use crate::scripts;
use crate::task::{Task, TaskKind, TaskPriority, TaskState, TaskStatusRecord};
use chrono::Utc;
use redgate_connection::{ConnectionFactory, ScriptExecutor, ScriptReply};
use redgate_core::{keys, TenantId};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Outcome of an enqueue attempt. Denials are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The task was accepted; `queue_depth` counts live plus scheduled
    /// tasks after the insert.
    Accepted { queue_depth: u64 },
    /// The queue is at its global capacity.
    QueueFull { queue_depth: u64 },
    /// The tenant's fairness share (a quarter of capacity) is used up.
    ProjectQueueFull { queue_depth: u64 },
}

impl EnqueueOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, EnqueueOutcome::Accepted { .. })
    }
}

/// A task handed to a worker, with its attempt number.
#[derive(Debug, Clone)]
pub struct DequeuedTask {
    pub task: Task,
    pub attempt: u32,
}

/// Outcome of [`TaskQueue::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-enqueued with backoff; the task will run again.
    Retrying {
        attempt: u32,
        delay: Duration,
        priority: TaskPriority,
    },
    /// Out of attempts (or retry declined); moved to the dead-letter
    /// store.
    DeadLettered { category: DlqCategory },
}

/// Per-queue statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    pub kind: TaskKind,
    pub queue_name: &'static str,
    /// Tasks in the live priority index.
    pub depth: u64,
    /// Tasks parked until their scheduled time.
    pub scheduled: u64,
    /// Live tasks per priority band.
    pub by_priority: Vec<(TaskPriority, u64)>,
    /// Creation time of the task at the head of the index.
    pub oldest_created_at: Option<chrono::DateTime<Utc>>,
    /// Creation time of the task at the tail of the index.
    pub newest_created_at: Option<chrono::DateTime<Utc>>,
}

/// The priority task queue.
///
/// All mutations are atomic server-side scripts; a task is in exactly one
/// of {scheduled, priority index, running, terminal status, dead-letter}
/// at any point, and `attempts <= max_attempts` for every task outside
/// the dead-letter store.
pub struct TaskQueue {
    factory: Arc<ConnectionFactory>,
    scripts: ScriptExecutor,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(factory: Arc<ConnectionFactory>, config: QueueConfig) -> Self {
        Self {
            factory,
            scripts: ScriptExecutor::new(&scripts::ALL),
            config,
        }
    }

    /// Loads the queue scripts via the admin path.
    pub async fn warm_up(&self) -> Result<(), QueueError> {
        self.factory
            .with_admin_connection(|conn| async move { self.scripts.warm_up(&conn).await })
            .await?;
        Ok(())
    }

    /// Enqueues a task under its tenant.
    ///
    /// A `scheduled_at` in the past is rejected before any I/O.
    pub async fn enqueue(&self, task: &Task) -> Result<EnqueueOutcome, QueueError> {
        if let Some(at) = task.scheduled_at {
            // Retries schedule slightly in the future; give clock skew a
            // small allowance but reject genuinely past times.
            if at < Utc::now() - chrono::Duration::seconds(1) {
                return Err(crate::task::TaskError::ScheduledInPast.into());
            }
        }

        let queue = task.task_type.queue_name();
        let task_json = serde_json::to_string(task)?;
        let script_keys = vec![
            keys::queue_priority(queue),
            keys::queue_scheduled(queue),
            keys::queue_seq(queue),
            keys::queue_project(queue, &task.project_id),
            keys::task_body(&task.task_id),
            keys::task_status(&task.task_id),
        ];
        let args = vec![
            task.priority.value().to_string(),
            task_json,
            self.config.max_size.to_string(),
            Utc::now().to_rfc3339(),
            task.scheduled_at
                .map(|t| t.timestamp_millis())
                .unwrap_or(0)
                .to_string(),
        ];

        let reply = self
            .factory
            .with_connection(&task.project_id, |conn| async move {
                self.scripts
                    .invoke(&conn, scripts::ENQUEUE.name, &script_keys, &args)
                    .await
            })
            .await?;

        let (accepted, reason, depth) = decode_outcome(reply)?;
        let outcome = match (accepted, reason.as_str()) {
            (true, _) => EnqueueOutcome::Accepted { queue_depth: depth },
            (false, "project_queue_full") => EnqueueOutcome::ProjectQueueFull { queue_depth: depth },
            (false, _) => EnqueueOutcome::QueueFull { queue_depth: depth },
        };

        if outcome.is_accepted() {
            tracing::debug!(
                task_id = %task.task_id,
                kind = task.task_type.as_str(),
                tenant = %task.project_id,
                priority = task.priority.value(),
                depth,
                "task enqueued"
            );
        } else {
            tracing::warn!(
                task_id = %task.task_id,
                kind = task.task_type.as_str(),
                tenant = %task.project_id,
                reason = %reason,
                "enqueue rejected"
            );
        }

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "redgate_queue_enqueues_total",
            "queue" => task.task_type.queue_name(),
            "outcome" => if outcome.is_accepted() { "accepted" } else { "rejected" }
        )
        .increment(1);

        Ok(outcome)
    }

    /// Dequeues the highest-priority due task of `kind` for this tenant.
    pub async fn dequeue(
        &self,
        kind: TaskKind,
        tenant: &TenantId,
        worker_id: &str,
    ) -> Result<Option<DequeuedTask>, QueueError> {
        let queue = kind.queue_name();
        let script_keys = vec![
            keys::queue_priority(queue),
            keys::queue_scheduled(queue),
            keys::queue_seq(queue),
            keys::queue_base(queue),
            keys::task_prefix(),
        ];
        self.run_dequeue(scripts::DEQUEUE.name, tenant, script_keys, worker_id)
            .await
    }

    /// Project-preferred dequeue: the tenant sub-queue is probed first,
    /// then the global priority index. Scheduled tasks stay invisible on
    /// both paths until due.
    pub async fn dequeue_for_project(
        &self,
        kind: TaskKind,
        tenant: &TenantId,
        worker_id: &str,
    ) -> Result<Option<DequeuedTask>, QueueError> {
        let queue = kind.queue_name();
        let script_keys = vec![
            keys::queue_priority(queue),
            keys::queue_scheduled(queue),
            keys::queue_seq(queue),
            keys::queue_base(queue),
            keys::task_prefix(),
            keys::queue_project(queue, tenant),
        ];
        self.run_dequeue(scripts::DEQUEUE_PROJECT.name, tenant, script_keys, worker_id)
            .await
    }

    async fn run_dequeue(
        &self,
        script: &str,
        tenant: &TenantId,
        script_keys: Vec<String>,
        worker_id: &str,
    ) -> Result<Option<DequeuedTask>, QueueError> {
        let args = vec![
            worker_id.to_string(),
            Utc::now().to_rfc3339(),
            Utc::now().timestamp_millis().to_string(),
        ];

        let reply = self
            .factory
            .with_connection(tenant, |conn| async move {
                self.scripts.invoke(&conn, script, &script_keys, &args).await
            })
            .await?;

        let items = reply
            .into_array()
            .map_err(|e| QueueError::Decode(e.to_string()))?;
        let found = items.first().and_then(|i| i.as_i64()).unwrap_or(0) == 1;
        if !found {
            return Ok(None);
        }

        let task_json = items
            .get(1)
            .and_then(|i| i.as_str())
            .ok_or_else(|| QueueError::Decode("dequeue reply missing task json".to_string()))?;
        let attempt = items.get(2).and_then(|i| i.as_i64()).unwrap_or(1) as u32;
        let task: Task = serde_json::from_str(task_json)?;

        tracing::debug!(
            task_id = %task.task_id,
            worker_id,
            attempt,
            "task dequeued"
        );

        Ok(Some(DequeuedTask { task, attempt }))
    }

    /// Marks a task completed with its result.
    pub async fn complete(
        &self,
        tenant: &TenantId,
        task_id: &Uuid,
        result: Option<serde_json::Value>,
        worker_id: &str,
    ) -> Result<(), QueueError> {
        let result_json = match result {
            Some(v) => serde_json::to_string(&v)?,
            None => String::new(),
        };
        self.write_status(
            tenant,
            task_id,
            TaskState::Completed,
            result_json,
            String::new(),
            worker_id.to_string(),
        )
        .await?;

        #[cfg(feature = "metrics")]
        metrics::counter!("redgate_queue_tasks_total", "outcome" => "completed").increment(1);

        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// While attempts remain and `retry` is set, the task is re-enqueued
    /// with exponential backoff (capped at 300 s) and a one-band priority
    /// bump; otherwise it is marked failed and moved to the dead-letter
    /// store.
    pub async fn fail(
        &self,
        dlq: &DeadLetterQueue,
        tenant: &TenantId,
        task_id: &Uuid,
        error: &str,
        retry: bool,
    ) -> Result<FailOutcome, QueueError> {
        let task = self
            .task(tenant, task_id)
            .await?
            .ok_or(QueueError::TaskNotFound(*task_id))?;
        let status = self
            .status(tenant, task_id)
            .await?
            .ok_or(QueueError::TaskNotFound(*task_id))?;
        let attempts = status.attempts;

        if retry && attempts < task.max_attempts {
            let delay = Duration::from_secs(2u64.saturating_pow(attempts).min(300));
            let retried = task.retry_copy(attempts, error, delay);

            if self.enqueue(&retried).await?.is_accepted() {
                self.write_status(
                    tenant,
                    task_id,
                    TaskState::Retrying,
                    String::new(),
                    error.to_string(),
                    String::new(),
                )
                .await?;

                tracing::info!(
                    task_id = %task_id,
                    attempt = attempts,
                    delay_seconds = delay.as_secs(),
                    priority = retried.priority.value(),
                    "task scheduled for retry"
                );

                #[cfg(feature = "metrics")]
                metrics::counter!("redgate_queue_tasks_total", "outcome" => "retrying")
                    .increment(1);

                return Ok(FailOutcome::Retrying {
                    attempt: attempts,
                    delay,
                    priority: retried.priority,
                });
            }
            // The queue refused the retry copy; fall through to the
            // dead-letter path as a system error.
            return self
                .dead_letter(dlq, &task, error, attempts, DlqCategory::SystemError)
                .await;
        }

        let category = if attempts >= task.max_attempts {
            DlqCategory::RetryExhausted
        } else {
            DlqCategory::InvalidData
        };
        self.dead_letter(dlq, &task, error, attempts, category).await
    }

    async fn dead_letter(
        &self,
        dlq: &DeadLetterQueue,
        task: &Task,
        error: &str,
        attempts: u32,
        category: DlqCategory,
    ) -> Result<FailOutcome, QueueError> {
        self.write_status(
            &task.project_id,
            &task.task_id,
            TaskState::Failed,
            String::new(),
            error.to_string(),
            String::new(),
        )
        .await?;

        let severity = match category {
            DlqCategory::SystemError => DlqSeverity::High,
            _ => DlqSeverity::Medium,
        };
        dlq.add(task, error, attempts, category, severity).await?;

        #[cfg(feature = "metrics")]
        metrics::counter!("redgate_queue_tasks_total", "outcome" => "dead_lettered").increment(1);

        Ok(FailOutcome::DeadLettered { category })
    }

    /// Cancels a task that is still queued or scheduled. Returns false
    /// when the task is unknown or already running.
    pub async fn cancel(&self, tenant: &TenantId, task_id: &Uuid) -> Result<bool, QueueError> {
        let task = match self.task(tenant, task_id).await? {
            Some(task) => task,
            None => return Ok(false),
        };
        let queue = task.task_type.queue_name();
        let script_keys = vec![
            keys::queue_priority(queue),
            keys::queue_scheduled(queue),
            keys::queue_base(queue),
            keys::task_body(task_id),
            keys::task_status(task_id),
        ];
        let args = vec![Utc::now().to_rfc3339()];

        let reply = self
            .factory
            .with_connection(tenant, |conn| async move {
                self.scripts
                    .invoke(&conn, scripts::CANCEL.name, &script_keys, &args)
                    .await
            })
            .await?;

        let items = reply
            .into_array()
            .map_err(|e| QueueError::Decode(e.to_string()))?;
        Ok(items.first().and_then(|i| i.as_i64()).unwrap_or(0) == 1)
    }

    /// The task body, if still retained.
    pub async fn task(&self, tenant: &TenantId, task_id: &Uuid) -> Result<Option<Task>, QueueError> {
        let key = keys::task_body(task_id);
        let json = self
            .factory
            .with_connection(tenant, |conn| async move { conn.get(&key).await })
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// The task's status record, if still retained.
    pub async fn status(
        &self,
        tenant: &TenantId,
        task_id: &Uuid,
    ) -> Result<Option<TaskStatusRecord>, QueueError> {
        let key = keys::task_status(task_id);
        let fields = self
            .factory
            .with_connection(tenant, |conn| async move { conn.hgetall(&key).await })
            .await?;
        Ok(TaskStatusRecord::from_fields(&fields))
    }

    /// Live depth of the priority index for `kind`.
    pub async fn queue_depth(&self, tenant: &TenantId, kind: TaskKind) -> Result<u64, QueueError> {
        let key = keys::queue_priority(kind.queue_name());
        let depth = self
            .factory
            .with_connection(tenant, |conn| async move { conn.zcard(&key).await })
            .await?;
        Ok(depth)
    }

    /// Depth of the tenant sub-queue for `kind`.
    pub async fn project_queue_depth(
        &self,
        tenant: &TenantId,
        kind: TaskKind,
    ) -> Result<u64, QueueError> {
        let key = keys::queue_project(kind.queue_name(), tenant);
        let depth = self
            .factory
            .with_connection(tenant, |conn| async move { conn.llen(&key).await })
            .await?;
        Ok(depth)
    }

    /// Statistics for one queue.
    pub async fn stats(&self, tenant: &TenantId, kind: TaskKind) -> Result<QueueStats, QueueError> {
        let priority_key = keys::queue_priority(kind.queue_name());
        let scheduled_key = keys::queue_scheduled(kind.queue_name());

        let (depth, scheduled, by_priority, head, tail) = self
            .factory
            .with_connection(tenant, |conn| async move {
                let depth = conn.zcard(&priority_key).await?;
                let scheduled = conn.zcard(&scheduled_key).await?;
                let mut by_priority = Vec::new();
                for band in [
                    TaskPriority::Urgent,
                    TaskPriority::Critical,
                    TaskPriority::High,
                    TaskPriority::Normal,
                    TaskPriority::Low,
                ] {
                    // Scores are -priority * 1e12 + seq with seq >= 1, so
                    // each band occupies a disjoint score range.
                    let base = -(band.value() as f64) * 1e12;
                    let count = conn.zcount(&priority_key, base, base + 1e12 - 1.0).await?;
                    if count > 0 {
                        by_priority.push((band, count));
                    }
                }
                let head = conn.zrange_withscores(&priority_key, 0, 0).await?;
                let tail = conn.zrange_withscores(&priority_key, -1, -1).await?;
                Ok((depth, scheduled, by_priority, head, tail))
            })
            .await?;

        let created_at = |members: &[(String, f64)]| {
            members
                .first()
                .and_then(|(json, _)| serde_json::from_str::<Task>(json).ok())
                .map(|t| t.created_at)
        };

        Ok(QueueStats {
            kind,
            queue_name: kind.queue_name(),
            depth,
            scheduled,
            by_priority,
            oldest_created_at: created_at(&head),
            newest_created_at: created_at(&tail),
        })
    }

    /// Deletes task bodies and status hashes older than `max_age`.
    ///
    /// Records normally evict via their 24 h TTL; this pass is the
    /// backstop run by the orchestrator's cleanup loop.
    pub async fn cleanup_expired(
        &self,
        tenant: &TenantId,
        max_age: Duration,
    ) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age.as_secs() as i64);
        let removed = self
            .factory
            .with_connection(tenant, |conn| async move {
                let mut removed = 0;
                for key in conn.scan_match("task:*").await? {
                    if key.ends_with(":status") {
                        continue;
                    }
                    let Some(json) = conn.get(&key).await? else {
                        continue;
                    };
                    let Ok(task) = serde_json::from_str::<Task>(&json) else {
                        continue;
                    };
                    if task.created_at < cutoff {
                        conn.del(&key).await?;
                        conn.del(&format!("{key}:status")).await?;
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await?;
        if removed > 0 {
            tracing::info!(tenant = %tenant, removed, "cleaned up expired tasks");
        }
        Ok(removed)
    }

    async fn write_status(
        &self,
        tenant: &TenantId,
        task_id: &Uuid,
        state: TaskState,
        result: String,
        error: String,
        worker_id: String,
    ) -> Result<(), QueueError> {
        let script_keys = vec![keys::task_status(task_id)];
        let args = vec![
            state.as_str().to_string(),
            Utc::now().to_rfc3339(),
            result,
            error,
            worker_id,
        ];
        self.factory
            .with_connection(tenant, |conn| async move {
                self.scripts
                    .invoke(&conn, scripts::COMPLETE.name, &script_keys, &args)
                    .await
            })
            .await?;
        Ok(())
    }
}

fn decode_outcome(reply: ScriptReply) -> Result<(bool, String, u64), QueueError> {
    let items = reply
        .into_array()
        .map_err(|e| QueueError::Decode(e.to_string()))?;
    let accepted = items.first().and_then(|i| i.as_i64()).unwrap_or(0) == 1;
    let reason = items
        .get(1)
        .and_then(|i| i.as_str())
        .unwrap_or("")
        .to_string();
    let depth = items.get(2).and_then(|i| i.as_i64()).unwrap_or(0).max(0) as u64;
    Ok((accepted, reason, depth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use redgate_connection::fake::{FakeConnector, FakeStore};
    use redgate_connection::ConnectionConfig;

    fn tenant() -> TenantId {
        TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb").unwrap()
    }

    async fn queue_with(store: &FakeStore, max_size: u64) -> (TaskQueue, DeadLetterQueue) {
        let factory = ConnectionFactory::with_connector(
            ConnectionConfig::default(),
            Arc::new(FakeConnector::new(store.clone())),
        )
        .await
        .unwrap();
        (
            TaskQueue::new(Arc::clone(&factory), QueueConfig { max_size }),
            DeadLetterQueue::new(factory),
        )
    }

    fn simple_task(priority: TaskPriority) -> Task {
        Task::builder(TaskKind::AgentTask, tenant())
            .priority(priority)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trips() {
        let store = FakeStore::new();
        let (queue, _) = queue_with(&store, 100).await;
        let task = simple_task(TaskPriority::Normal);

        assert!(queue.enqueue(&task).await.unwrap().is_accepted());

        let dequeued = queue
            .dequeue(TaskKind::AgentTask, &tenant(), "worker-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dequeued.task.task_id, task.task_id);
        assert_eq!(dequeued.attempt, 1);

        let status = queue.status(&tenant(), &task.task_id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskState::Running);
        assert_eq!(status.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(status.attempts, 1);

        // Queue is empty now.
        assert!(queue
            .dequeue(TaskKind::AgentTask, &tenant(), "worker-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn dequeue_follows_priority_then_insertion_order() {
        let store = FakeStore::new();
        let (queue, _) = queue_with(&store, 100).await;

        let a = simple_task(TaskPriority::Low);
        let b = simple_task(TaskPriority::Urgent);
        let c = simple_task(TaskPriority::Normal);
        let d = simple_task(TaskPriority::Critical);
        let e = simple_task(TaskPriority::High);
        for task in [&a, &b, &c, &d, &e] {
            assert!(queue.enqueue(task).await.unwrap().is_accepted());
        }

        let mut order = Vec::new();
        while let Some(dequeued) = queue
            .dequeue(TaskKind::AgentTask, &tenant(), "w")
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
    async fn equal_priority_ties_break_by_insertion() {
        let store = FakeStore::new();
        let (queue, _) = queue_with(&store, 100).await;

        let first = simple_task(TaskPriority::Normal);
        let second = simple_task(TaskPriority::Normal);
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let got = queue
            .dequeue(TaskKind::AgentTask, &tenant(), "w")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.task.task_id, first.task_id);
    }

    #[tokio::test]
    async fn queue_full_is_a_value_not_an_error() {
        let store = FakeStore::new();
        let (queue, _) = queue_with(&store, 8).await;

        // Project cap is a quarter of the global max.
        for _ in 0..2 {
            assert!(queue
                .enqueue(&simple_task(TaskPriority::Normal))
                .await
                .unwrap()
                .is_accepted());
        }
        let outcome = queue
            .enqueue(&simple_task(TaskPriority::Normal))
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::ProjectQueueFull { .. }));
    }

    #[tokio::test]
    async fn scheduled_tasks_are_invisible_until_due() {
        let store = FakeStore::new();
        let (queue, _) = queue_with(&store, 100).await;

        let task = Task::builder(TaskKind::AgentTask, tenant())
            .scheduled_at(Utc::now() + chrono::Duration::milliseconds(150))
            .build()
            .unwrap();
        queue.enqueue(&task).await.unwrap();

        assert!(queue
            .dequeue(TaskKind::AgentTask, &tenant(), "w")
            .await
            .unwrap()
            .is_none());
        assert!(queue
            .dequeue_for_project(TaskKind::AgentTask, &tenant(), "w")
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;

        let got = queue
            .dequeue(TaskKind::AgentTask, &tenant(), "w")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.task.task_id, task.task_id);
    }

    #[tokio::test]
    async fn complete_records_result() {
        let store = FakeStore::new();
        let (queue, _) = queue_with(&store, 100).await;
        let task = simple_task(TaskPriority::Normal);
        queue.enqueue(&task).await.unwrap();
        queue
            .dequeue(TaskKind::AgentTask, &tenant(), "w")
            .await
            .unwrap();

        queue
            .complete(
                &tenant(),
                &task.task_id,
                Some(serde_json::json!({"ok": true})),
                "w",
            )
            .await
            .unwrap();

        let status = queue.status(&tenant(), &task.task_id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskState::Completed);
        assert!(status.completed_at.is_some());
        assert_eq!(status.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn fail_retries_then_dead_letters() {
        let store = FakeStore::new();
        let (queue, dlq) = queue_with(&store, 100).await;
        let task = Task::builder(TaskKind::AgentTask, tenant())
            .max_attempts(2)
            .build()
            .unwrap();
        queue.enqueue(&task).await.unwrap();
        queue
            .dequeue(TaskKind::AgentTask, &tenant(), "w")
            .await
            .unwrap();

        // First failure: retried with backoff and a priority bump.
        let outcome = queue
            .fail(&dlq, &tenant(), &task.task_id, "boom", true)
            .await
            .unwrap();
        match outcome {
            FailOutcome::Retrying {
                attempt,
                delay,
                priority,
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_secs(2));
                assert_eq!(priority, TaskPriority::High);
            }
            other => panic!("expected retry, got {other:?}"),
        }
        let status = queue.status(&tenant(), &task.task_id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskState::Retrying);
        assert_eq!(status.attempts, 1);

        // Let the backoff elapse, then run and fail again.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        let second = queue
            .dequeue(TaskKind::AgentTask, &tenant(), "w")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.attempt, 2);

        let outcome = queue
            .fail(&dlq, &tenant(), &task.task_id, "boom", true)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::DeadLettered {
                category: DlqCategory::RetryExhausted
            }
        );

        let status = queue.status(&tenant(), &task.task_id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskState::Failed);
        assert_eq!(status.attempts, 2);

        let entry = dlq.get(&tenant(), &task.task_id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.category, DlqCategory::RetryExhausted);
    }

    #[tokio::test]
    async fn cancel_removes_queued_task() {
        let store = FakeStore::new();
        let (queue, _) = queue_with(&store, 100).await;
        let task = simple_task(TaskPriority::Normal);
        queue.enqueue(&task).await.unwrap();

        assert!(queue.cancel(&tenant(), &task.task_id).await.unwrap());
        assert!(queue
            .dequeue(TaskKind::AgentTask, &tenant(), "w")
            .await
            .unwrap()
            .is_none());
        let status = queue.status(&tenant(), &task.task_id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskState::Cancelled);

        // Cancelling again reports false: the task is no longer queued.
        assert!(!queue.cancel(&tenant(), &task.task_id).await.unwrap());
    }

    #[tokio::test]
    async fn stats_count_bands_and_scheduled() {
        let store = FakeStore::new();
        let (queue, _) = queue_with(&store, 100).await;

        queue.enqueue(&simple_task(TaskPriority::Urgent)).await.unwrap();
        queue.enqueue(&simple_task(TaskPriority::Normal)).await.unwrap();
        queue.enqueue(&simple_task(TaskPriority::Normal)).await.unwrap();
        queue
            .enqueue(
                &Task::builder(TaskKind::AgentTask, tenant())
                    .scheduled_at(Utc::now() + chrono::Duration::seconds(60))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        let stats = queue.stats(&tenant(), TaskKind::AgentTask).await.unwrap();
        assert_eq!(stats.depth, 3);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(
            stats.by_priority,
            vec![(TaskPriority::Urgent, 1), (TaskPriority::Normal, 2)]
        );
        assert!(stats.oldest_created_at.is_some());
        assert!(stats.newest_created_at >= stats.oldest_created_at);
    }

    #[tokio::test]
    async fn project_preferred_path_serves_the_sub_queue_in_arrival_order() {
        let store = FakeStore::new();
        let (queue, _) = queue_with(&store, 100).await;

        let first = simple_task(TaskPriority::Normal);
        let second = simple_task(TaskPriority::Urgent);
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        // The sub-queue is probed first, so the tenant's oldest task wins
        // the fast path; the priority index stays consistent with it.
        let got = queue
            .dequeue_for_project(TaskKind::AgentTask, &tenant(), "w")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.task.task_id, first.task_id);

        let got = queue
            .dequeue_for_project(TaskKind::AgentTask, &tenant(), "w")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.task.task_id, second.task_id);

        assert!(queue
            .dequeue(TaskKind::AgentTask, &tenant(), "w")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn global_capacity_counts_scheduled_tasks() {
        let store = FakeStore::new();
        let (queue, _) = queue_with(&store, 8).await;

        // Scheduled tasks bypass the sub-queue but count toward the
        // global bound.
        for _ in 0..8 {
            let task = Task::builder(TaskKind::AgentTask, tenant())
                .scheduled_at(Utc::now() + chrono::Duration::seconds(120))
                .build()
                .unwrap();
            assert!(queue.enqueue(&task).await.unwrap().is_accepted());
        }

        let outcome = queue
            .enqueue(&simple_task(TaskPriority::Normal))
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::QueueFull { .. }));
    }
}
