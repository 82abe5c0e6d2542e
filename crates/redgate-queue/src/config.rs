use crate::task::TaskKind;
use redgate_core::TenantId;
use std::time::Duration;

/// Queue-wide configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Global capacity per queue (live plus scheduled tasks). Each
    /// tenant's sub-queue is capped at a quarter of this.
    pub max_size: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_size: 1000 }
    }
}

/// Configuration for one worker in the pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identifier recorded on every task this worker runs.
    pub worker_id: String,
    /// Task kinds this worker handles, probed in order.
    pub kinds: Vec<TaskKind>,
    /// Tenants this worker polls, probed in order.
    pub tenants: Vec<TenantId>,
    /// In-flight task cap.
    pub max_concurrent: usize,
    /// Sleep between polls when idle or saturated.
    pub poll_interval: Duration,
    /// How long graceful shutdown waits for in-flight tasks.
    pub drain_timeout: Duration,
}

impl WorkerConfig {
    /// A worker with the default knobs: 5 concurrent tasks, 1 s poll,
    /// 30 s drain.
    pub fn new(worker_id: impl Into<String>, kinds: Vec<TaskKind>, tenants: Vec<TenantId>) -> Self {
        Self {
            worker_id: worker_id.into(),
            kinds,
            tenants,
            max_concurrent: 5,
            poll_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}
