//! Worker pool.
//!
//! Each worker polls its configured tenants and task kinds, dispatches
//! handlers concurrently up to its in-flight cap, and bounds every
//! attempt by the task's own timeout. Graceful shutdown drains in-flight
//! work within a bounded window; whatever exceeds it is abandoned and the
//! task stays `running` until its per-task timeout makes it an operator
//! concern.

use crate::config::WorkerConfig;
use crate::dead_letter::DeadLetterQueue;
use crate::error::QueueError;
use crate::queue::{DequeuedTask, TaskQueue};
use crate::task::{Task, TaskKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A handler's failure report: what went wrong, and whether the attempt
/// should be retried.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub error: String,
    pub retry: bool,
}

impl TaskFailure {
    /// A transient failure worth retrying.
    pub fn retryable(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retry: true,
        }
    }

    /// A permanent failure; the task goes straight to the dead-letter
    /// store.
    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retry: false,
        }
    }
}

/// Business logic for one task kind. The substrate treats the payload as
/// opaque; handlers own its meaning.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<serde_json::Value, TaskFailure>;
}

/// Per-worker counters.
#[derive(Default)]
struct WorkerCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
}

/// Snapshot of one worker's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_id: String,
    pub processed: u64,
    pub failed: u64,
    pub in_flight: usize,
}

/// A pool of workers over one task queue.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    dlq: Arc<DeadLetterQueue>,
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
    workers: Vec<WorkerConfig>,
    counters: Vec<(String, Arc<WorkerCounters>)>,
    shutdown_tx: watch::Sender<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<TaskQueue>, dlq: Arc<DeadLetterQueue>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            dlq,
            handlers: HashMap::new(),
            workers: Vec::new(),
            counters: Vec::new(),
            shutdown_tx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Registers the handler for a task kind. Workers only dequeue kinds
    /// they have handlers for.
    pub fn register_handler(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Adds a worker to the pool.
    pub fn add_worker(&mut self, config: WorkerConfig) {
        self.counters
            .push((config.worker_id.clone(), Arc::new(WorkerCounters::default())));
        self.workers.push(config);
    }

    /// Spawns every worker loop.
    pub fn start(&self) {
        let mut handles = self.handles.lock().expect("worker handle lock poisoned");
        for (config, (_, counters)) in self.workers.iter().zip(&self.counters) {
            let worker = Worker {
                config: config.clone(),
                queue: Arc::clone(&self.queue),
                dlq: Arc::clone(&self.dlq),
                handlers: self.handlers.clone(),
                counters: Arc::clone(counters),
                shutdown: self.shutdown_tx.subscribe(),
            };
            tracing::info!(
                worker_id = %config.worker_id,
                kinds = ?config.kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
                "starting worker"
            );
            handles.push(tokio::spawn(worker.run()));
        }
    }

    /// Signals every worker to stop and waits for them to drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("worker handle lock poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker task ended abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }

    /// Current counters for every worker.
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.counters
            .iter()
            .map(|(worker_id, counters)| WorkerStats {
                worker_id: worker_id.clone(),
                processed: counters.processed.load(Ordering::Relaxed),
                failed: counters.failed.load(Ordering::Relaxed),
                in_flight: counters.in_flight.load(Ordering::Relaxed),
            })
            .collect()
    }
}

struct Worker {
    config: WorkerConfig,
    queue: Arc<TaskQueue>,
    dlq: Arc<DeadLetterQueue>,
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
    counters: Arc<WorkerCounters>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if self.counters.in_flight.load(Ordering::Acquire) >= self.config.max_concurrent {
                self.idle().await;
                continue;
            }

            let mut dispatched = false;
            'scan: for tenant in self.config.tenants.clone() {
                for kind in self.config.kinds.clone() {
                    if !self.handlers.contains_key(&kind) {
                        continue;
                    }
                    match self
                        .queue
                        .dequeue_for_project(kind, &tenant, &self.config.worker_id)
                        .await
                    {
                        Ok(Some(dequeued)) => {
                            self.dispatch(dequeued);
                            dispatched = true;
                            if self.counters.in_flight.load(Ordering::Acquire)
                                >= self.config.max_concurrent
                            {
                                break 'scan;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(
                                worker_id = %self.config.worker_id,
                                kind = kind.as_str(),
                                error = %e,
                                "dequeue failed; backing off"
                            );
                            self.idle().await;
                            continue 'scan;
                        }
                    }
                }
            }

            if !dispatched {
                self.idle().await;
            }
        }

        self.drain().await;
    }

    /// Sleeps one poll interval, waking early on shutdown.
    async fn idle(&mut self) {
        let interval = self.config.poll_interval;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    fn dispatch(&self, dequeued: DequeuedTask) {
        let handler = match self.handlers.get(&dequeued.task.task_type) {
            Some(handler) => Arc::clone(handler),
            None => return,
        };
        let queue = Arc::clone(&self.queue);
        let dlq = Arc::clone(&self.dlq);
        let counters = Arc::clone(&self.counters);
        let worker_id = self.config.worker_id.clone();

        counters.in_flight.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let result =
                Self::process(&queue, &dlq, handler.as_ref(), &dequeued.task, &worker_id).await;
            match result {
                Ok(true) => {
                    counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        task_id = %dequeued.task.task_id,
                        error = %e,
                        "failed to record task outcome"
                    );
                }
            }
            counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Runs one attempt, bounded by the task's own timeout. Returns
    /// whether the attempt succeeded.
    async fn process(
        queue: &TaskQueue,
        dlq: &DeadLetterQueue,
        handler: &dyn TaskHandler,
        task: &Task,
        worker_id: &str,
    ) -> Result<bool, QueueError> {
        let budget = Duration::from_secs(task.timeout_seconds as u64);
        let tenant = task.project_id;

        match tokio::time::timeout(budget, handler.handle(task)).await {
            Ok(Ok(result)) => {
                queue
                    .complete(&tenant, &task.task_id, Some(result), worker_id)
                    .await?;
                Ok(true)
            }
            Ok(Err(failure)) => {
                queue
                    .fail(dlq, &tenant, &task.task_id, &failure.error, failure.retry)
                    .await?;
                Ok(false)
            }
            Err(_) => {
                let error = format!("task timed out after {}s", task.timeout_seconds);
                tracing::warn!(task_id = %task.task_id, %error, "task attempt timed out");
                queue.fail(dlq, &tenant, &task.task_id, &error, true).await?;
                Ok(false)
            }
        }
    }

    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while self.counters.in_flight.load(Ordering::Acquire) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let abandoned = self.counters.in_flight.load(Ordering::Acquire);
        if abandoned > 0 {
            tracing::warn!(
                worker_id = %self.config.worker_id,
                abandoned,
                "drain window elapsed; abandoning in-flight tasks"
            );
        } else {
            tracing::info!(worker_id = %self.config.worker_id, "worker drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::task::TaskPriority;
    use redgate_connection::fake::{FakeConnector, FakeStore};
    use redgate_connection::{ConnectionConfig, ConnectionFactory};
    use redgate_core::TenantId;

    struct FlakyHandler {
        fail_first: AtomicU64,
    }

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        async fn handle(&self, _task: &Task) -> Result<serde_json::Value, TaskFailure> {
            if self.fail_first.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            })
            .is_ok()
            {
                Err(TaskFailure::retryable("temporary glitch"))
            } else {
                Ok(serde_json::json!({"done": true}))
            }
        }
    }

    async fn pool_with_handler(
        store: &FakeStore,
        tenant: TenantId,
        handler: Arc<dyn TaskHandler>,
    ) -> (Arc<TaskQueue>, WorkerPool) {
        let factory = ConnectionFactory::with_connector(
            ConnectionConfig::default(),
            Arc::new(FakeConnector::new(store.clone())),
        )
        .await
        .unwrap();
        let queue = Arc::new(TaskQueue::new(Arc::clone(&factory), QueueConfig::default()));
        let dlq = Arc::new(DeadLetterQueue::new(factory));

        let mut pool = WorkerPool::new(Arc::clone(&queue), dlq);
        pool.register_handler(TaskKind::AgentTask, handler);
        pool.add_worker(
            WorkerConfig::new("worker-1", vec![TaskKind::AgentTask], vec![tenant])
                .poll_interval(Duration::from_millis(20))
                .drain_timeout(Duration::from_secs(2)),
        );
        (queue, pool)
    }

    #[tokio::test]
    async fn worker_processes_enqueued_task() {
        let store = FakeStore::new();
        let tenant = TenantId::random();
        let handler = Arc::new(FlakyHandler {
            fail_first: AtomicU64::new(0),
        });
        let (queue, pool) = pool_with_handler(&store, tenant, handler).await;

        let task = Task::builder(TaskKind::AgentTask, tenant)
            .priority(TaskPriority::Normal)
            .build()
            .unwrap();
        queue.enqueue(&task).await.unwrap();

        pool.start();

        // Wait for the worker to pick it up and finish.
        for _ in 0..50 {
            let status = queue.status(&tenant, &task.task_id).await.unwrap();
            if status
                .as_ref()
                .map(|s| s.status == crate::task::TaskState::Completed)
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        pool.shutdown().await;

        let status = queue.status(&tenant, &task.task_id).await.unwrap().unwrap();
        assert_eq!(status.status, crate::task::TaskState::Completed);
        let stats = pool.stats();
        assert_eq!(stats[0].processed, 1);
        assert_eq!(stats[0].in_flight, 0);
    }

    #[tokio::test]
    async fn failed_attempt_is_marked_for_retry() {
        let store = FakeStore::new();
        let tenant = TenantId::random();
        let handler = Arc::new(FlakyHandler {
            fail_first: AtomicU64::new(1),
        });
        let (queue, pool) = pool_with_handler(&store, tenant, handler).await;

        let task = Task::builder(TaskKind::AgentTask, tenant)
            .max_attempts(3)
            .build()
            .unwrap();
        queue.enqueue(&task).await.unwrap();

        pool.start();
        for _ in 0..50 {
            let status = queue.status(&tenant, &task.task_id).await.unwrap();
            if status
                .as_ref()
                .map(|s| s.status == crate::task::TaskState::Retrying)
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.shutdown().await;

        let status = queue.status(&tenant, &task.task_id).await.unwrap().unwrap();
        assert_eq!(status.status, crate::task::TaskState::Retrying);
        assert_eq!(status.attempts, 1);
    }
}
