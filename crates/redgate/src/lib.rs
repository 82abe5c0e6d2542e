//! redgate: a multi-tenant Redis-backed coordination substrate.
//!
//! One logical Redis endpoint fronts a stateful backend service; this
//! crate multiplexes it into strictly isolated per-tenant facilities:
//!
//! - **Connections** — a factory of bounded tenant pools behind a shared
//!   circuit breaker, with a key-rewriting allowlist connection as the
//!   isolation boundary ([`redgate_connection`])
//! - **Rate limiting** — atomic sliding-window and token-bucket checks
//!   with composite user/project/ip/endpoint decisions, failing open
//!   when the store is down ([`redgate_ratelimiter`])
//! - **Task queue** — priority queue with tenant fairness caps,
//!   scheduling, retries, a dead-letter store and a worker pool
//!   ([`redgate_queue`])
//! - **Cache & sessions** — versioned tagged cache, sliding-expiry
//!   sessions, progress trackers ([`redgate_cache`])
//! - **Health** — sampling, command latency percentiles, threshold
//!   alerting ([`redgate_health`])
//!
//! The [`Substrate`] orchestrator owns every component and background
//! loop; external collaborators (HTTP handlers, agent runtimes) consume
//! its accessors.
//!
//! ## Example
//!
//! ```rust,no_run
//! use redgate::{Substrate, SubstrateConfig};
//! use redgate_core::TenantId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let substrate = Substrate::builder(SubstrateConfig::from_env())
//!     .serve_tenants(vec![TenantId::parse(
//!         "6f7deacc-9d74-4984-a6ae-d0a78597bbcb",
//!     )?])
//!     .start()
//!     .await?;
//!
//! let health = substrate.health().await;
//! assert!(health.healthy);
//!
//! substrate.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub use agents::AgentConfigStore;
pub use config::{AgentSettings, SubstrateConfig};
pub use error::SubstrateError;
pub use orchestrator::{Substrate, SubstrateBuilder};

pub use redgate_cache::{
    CacheError, CacheRecord, Progress, ProgressState, ProgressTracker, Session, SessionStore,
    TenantCache,
};
pub use redgate_circuitbreaker::{
    BreakerStatus, CircuitBreaker, CircuitBreakerError, CircuitState,
};
pub use redgate_connection::{
    CommandCategory, CommandObserver, CommandRecord, Connection, ConnectionConfig,
    ConnectionError, ConnectionFactory, FactoryHealth, PoolStats, ScriptDef, ScriptExecutor,
};
pub use redgate_core::{InvalidTenant, TenantId};
pub use redgate_health::{
    standard_probe, Alert, AlertChannel, AlertManager, AlertRule, AlertSeverity, AlertStatus,
    Comparison, MetricProbe, MetricsSampler, MetricsSnapshot, SeverityChannel,
};
pub use redgate_queue::{
    is_auto_retry_eligible, DeadLetterQueue, DeadLetterTask, DequeuedTask, DlqCategory, DlqFilter,
    DlqSeverity, DlqStats, EnqueueOutcome, FailOutcome, QueueConfig, QueueError, QueueStats, Task,
    TaskBuilder, TaskError, TaskFailure, TaskHandler, TaskKind, TaskPriority, TaskQueue, TaskState,
    TaskStatusRecord, WorkerConfig, WorkerPool, WorkerStats,
};
pub use redgate_ratelimiter::{
    normalize_path, LimitKind, RateLimitConfig, RateLimitDecision, RateLimitError, RateLimiter,
    RateLimiterConfig, RequestDescriptor, READ_COST, WRITE_COST,
};

mod agents;
mod config;
mod error;
mod orchestrator;
