//! Priority task queue for the redgate substrate.
//!
//! Atomic enqueue/dequeue via server-side scripts, per-tenant sub-queues
//! with a fairness cap, scheduled execution, exponential-backoff retries
//! with priority bumps, a dead-letter store with automatic re-injection
//! of transient failures, and a worker pool with graceful drain.
//!
//! ## Example
//!
//! ```rust,no_run
//! use redgate_connection::{ConnectionConfig, ConnectionFactory};
//! use redgate_core::TenantId;
//! use redgate_queue::{QueueConfig, Task, TaskKind, TaskPriority, TaskQueue};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = ConnectionFactory::connect(ConnectionConfig::from_env()).await?;
//! let queue = TaskQueue::new(factory, QueueConfig::default());
//! queue.warm_up().await?;
//!
//! let tenant = TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb")?;
//! let task = Task::builder(TaskKind::AgentTask, tenant)
//!     .data(serde_json::json!({"prompt": "summarize"}))
//!     .priority(TaskPriority::High)
//!     .build()?;
//!
//! let outcome = queue.enqueue(&task).await?;
//! assert!(outcome.is_accepted());
//! # Ok(())
//! # }
//! ```

pub use config::{QueueConfig, WorkerConfig};
pub use dead_letter::{
    is_auto_retry_eligible, DeadLetterQueue, DeadLetterTask, DlqCategory, DlqFilter, DlqSeverity,
    DlqStats,
};
pub use error::QueueError;
pub use queue::{DequeuedTask, EnqueueOutcome, FailOutcome, QueueStats, TaskQueue};
pub use task::{Task, TaskBuilder, TaskError, TaskKind, TaskPriority, TaskState, TaskStatusRecord};
pub use worker::{TaskFailure, TaskHandler, WorkerPool, WorkerStats};

mod config;
mod dead_letter;
mod error;
mod queue;
mod scripts;
mod task;
mod worker;
