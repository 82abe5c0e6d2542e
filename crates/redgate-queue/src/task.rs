//! Task model and wire format.
//!
//! Tasks and their status records persist as JSON (ISO-8601 UTC
//! timestamps, lowercase hyphenated UUIDs); the JSON doubles as the
//! member stored in the queue's sorted sets, so the exact serialized
//! string is what moves between the priority index, the tenant sub-queue
//! and the scheduled set.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redgate_core::TenantId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Task categories; each maps to its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    EmbeddingComputation,
    AgentTask,
    DocumentExport,
    BatchProcessing,
    Notification,
    Cleanup,
    HealthCheck,
}

impl TaskKind {
    /// All kinds, in a stable order.
    pub const ALL: [TaskKind; 7] = [
        TaskKind::EmbeddingComputation,
        TaskKind::AgentTask,
        TaskKind::DocumentExport,
        TaskKind::BatchProcessing,
        TaskKind::Notification,
        TaskKind::Cleanup,
        TaskKind::HealthCheck,
    ];

    /// Wire name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::EmbeddingComputation => "embedding_computation",
            TaskKind::AgentTask => "agent_task",
            TaskKind::DocumentExport => "document_export",
            TaskKind::BatchProcessing => "batch_processing",
            TaskKind::Notification => "notification",
            TaskKind::Cleanup => "cleanup",
            TaskKind::HealthCheck => "health_check",
        }
    }

    /// Queue name this kind is routed to.
    pub fn queue_name(&self) -> &'static str {
        match self {
            TaskKind::EmbeddingComputation => "embeddings",
            TaskKind::AgentTask => "agent_tasks",
            TaskKind::DocumentExport => "exports",
            TaskKind::BatchProcessing => "batch",
            TaskKind::Notification => "notifications",
            TaskKind::Cleanup => "cleanup",
            TaskKind::HealthCheck => "health_checks",
        }
    }
}

/// Priority bands. Higher value sorts first; the wire carries the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
    Urgent,
}

impl TaskPriority {
    /// Numeric priority carried on the wire.
    pub fn value(self) -> i32 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 5,
            TaskPriority::High => 10,
            TaskPriority::Critical => 20,
            TaskPriority::Urgent => 50,
        }
    }

    /// The next band up; retries are bumped one band, capped at Urgent.
    pub fn bump(self) -> Self {
        match self {
            TaskPriority::Low => TaskPriority::Normal,
            TaskPriority::Normal => TaskPriority::High,
            TaskPriority::High => TaskPriority::Critical,
            TaskPriority::Critical => TaskPriority::Urgent,
            TaskPriority::Urgent => TaskPriority::Urgent,
        }
    }
}

impl From<TaskPriority> for i32 {
    fn from(p: TaskPriority) -> i32 {
        p.value()
    }
}

impl TryFrom<i32> for TaskPriority {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TaskPriority::Low),
            5 => Ok(TaskPriority::Normal),
            10 => Ok(TaskPriority::High),
            20 => Ok(TaskPriority::Critical),
            50 => Ok(TaskPriority::Urgent),
            other => Err(format!("invalid task priority {other}")),
        }
    }
}

/// Task execution states as stored in the status hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    DeadLetter,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Retrying => "retrying",
            TaskState::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskState::Queued),
            "running" => Some(TaskState::Running),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            "cancelled" => Some(TaskState::Cancelled),
            "retrying" => Some(TaskState::Retrying),
            "dead_letter" => Some(TaskState::DeadLetter),
            _ => None,
        }
    }
}

/// Errors rejected at task construction, before any I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("scheduled_at cannot be in the past")]
    ScheduledInPast,

    #[error("timeout_seconds must be in 1..=3600, got {0}")]
    InvalidTimeout(u32),

    #[error("max_attempts must be in 1..=10, got {0}")]
    InvalidMaxAttempts(u32),
}

/// A queued unit of work. The payload is opaque to the substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub task_type: TaskKind,
    pub project_id: TenantId,
    pub priority: TaskPriority,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    /// Starts building a task for the given kind and tenant.
    pub fn builder(task_type: TaskKind, project_id: TenantId) -> TaskBuilder {
        TaskBuilder {
            task_type,
            project_id,
            priority: TaskPriority::Normal,
            data: serde_json::Value::Object(serde_json::Map::new()),
            scheduled_at: None,
            timeout_seconds: 300,
            max_attempts: 3,
            metadata: serde_json::Map::new(),
        }
    }

    /// The copy re-enqueued on retry: same identity, bumped one priority
    /// band, scheduled after the backoff delay, metadata recording the
    /// retry context.
    pub(crate) fn retry_copy(&self, attempt: u32, error: &str, delay: Duration) -> Task {
        let mut metadata = self.metadata.clone();
        metadata.insert("retry_attempt".to_string(), serde_json::json!(attempt + 1));
        metadata.insert("retry_error".to_string(), serde_json::json!(error));
        metadata.insert(
            "retry_delay_seconds".to_string(),
            serde_json::json!(delay.as_secs()),
        );

        Task {
            priority: self.priority.bump(),
            scheduled_at: Some(Utc::now() + ChronoDuration::seconds(delay.as_secs() as i64)),
            metadata,
            ..self.clone()
        }
    }
}

/// Builder validating the task invariants.
pub struct TaskBuilder {
    task_type: TaskKind,
    project_id: TenantId,
    priority: TaskPriority,
    data: serde_json::Value,
    scheduled_at: Option<DateTime<Utc>>,
    timeout_seconds: u32,
    max_attempts: u32,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl TaskBuilder {
    /// Sets the opaque payload.
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Sets the priority band.
    ///
    /// Default: Normal
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Defers execution until the given time.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Per-attempt execution budget in seconds (1..=3600).
    ///
    /// Default: 300
    pub fn timeout_seconds(mut self, seconds: u32) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Maximum delivery attempts (1..=10).
    ///
    /// Default: 3
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Attaches a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Result<Task, TaskError> {
        if let Some(at) = self.scheduled_at {
            if at < Utc::now() {
                return Err(TaskError::ScheduledInPast);
            }
        }
        if !(1..=3600).contains(&self.timeout_seconds) {
            return Err(TaskError::InvalidTimeout(self.timeout_seconds));
        }
        if !(1..=10).contains(&self.max_attempts) {
            return Err(TaskError::InvalidMaxAttempts(self.max_attempts));
        }

        Ok(Task {
            task_id: Uuid::new_v4(),
            task_type: self.task_type,
            project_id: self.project_id,
            priority: self.priority,
            data: self.data,
            created_at: Utc::now(),
            scheduled_at: self.scheduled_at,
            timeout_seconds: self.timeout_seconds,
            max_attempts: self.max_attempts,
            metadata: self.metadata,
        })
    }
}

/// Status record kept beside each task, backed by a hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub status: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl TaskStatusRecord {
    /// Parses the record from status hash fields; `None` when the hash is
    /// empty or carries no recognizable status.
    pub fn from_fields(fields: &[(String, String)]) -> Option<Self> {
        let lookup = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };
        let status = TaskState::parse(lookup("status")?)?;
        let parse_time = |name: &str| {
            lookup(name).and_then(|s| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            })
        };

        Some(TaskStatusRecord {
            status,
            worker_id: lookup("worker_id").map(|s| s.to_string()),
            queued_at: parse_time("queued_at"),
            started_at: parse_time("started_at"),
            completed_at: parse_time("completed_at"),
            attempts: lookup("attempts").and_then(|s| s.parse().ok()).unwrap_or(0),
            error: lookup("error").map(|s| s.to_string()),
            result: lookup("result").and_then(|s| serde_json::from_str(s).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb").unwrap()
    }

    #[test]
    fn wire_format_matches_schema() {
        let task = Task::builder(TaskKind::AgentTask, tenant())
            .data(serde_json::json!({"prompt": "hello"}))
            .priority(TaskPriority::High)
            .build()
            .unwrap();

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task_type"], "agent_task");
        assert_eq!(
            json["project_id"],
            "6f7deacc-9d74-4984-a6ae-d0a78597bbcb"
        );
        assert_eq!(json["priority"], 10);
        assert_eq!(json["timeout_seconds"], 300);
        assert!(json.get("scheduled_at").is_none());

        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn builder_rejects_past_schedule() {
        let result = Task::builder(TaskKind::Cleanup, tenant())
            .scheduled_at(Utc::now() - ChronoDuration::seconds(10))
            .build();
        assert_eq!(result.unwrap_err(), TaskError::ScheduledInPast);
    }

    #[test]
    fn builder_rejects_out_of_range_knobs() {
        assert_eq!(
            Task::builder(TaskKind::Cleanup, tenant())
                .timeout_seconds(0)
                .build()
                .unwrap_err(),
            TaskError::InvalidTimeout(0)
        );
        assert_eq!(
            Task::builder(TaskKind::Cleanup, tenant())
                .max_attempts(11)
                .build()
                .unwrap_err(),
            TaskError::InvalidMaxAttempts(11)
        );
    }

    #[test]
    fn priority_bands_bump_and_cap() {
        assert_eq!(TaskPriority::Low.bump(), TaskPriority::Normal);
        assert_eq!(TaskPriority::Normal.bump(), TaskPriority::High);
        assert_eq!(TaskPriority::High.bump(), TaskPriority::Critical);
        assert_eq!(TaskPriority::Critical.bump(), TaskPriority::Urgent);
        assert_eq!(TaskPriority::Urgent.bump(), TaskPriority::Urgent);
    }

    #[test]
    fn priority_round_trips_as_integer() {
        for p in [
            TaskPriority::Low,
            TaskPriority::Normal,
            TaskPriority::High,
            TaskPriority::Critical,
            TaskPriority::Urgent,
        ] {
            let json = serde_json::to_string(&p).unwrap();
            let back: TaskPriority = serde_json::from_str(&json).unwrap();
            assert_eq!(back, p);
        }
        assert!(serde_json::from_str::<TaskPriority>("7").is_err());
    }

    #[test]
    fn retry_copy_keeps_identity_and_records_context() {
        let task = Task::builder(TaskKind::AgentTask, tenant()).build().unwrap();
        let retried = task.retry_copy(1, "connection refused", Duration::from_secs(2));

        assert_eq!(retried.task_id, task.task_id);
        assert_eq!(retried.priority, TaskPriority::High);
        assert!(retried.scheduled_at.is_some());
        assert_eq!(retried.metadata["retry_attempt"], 2);
        assert_eq!(retried.metadata["retry_delay_seconds"], 2);
    }

    #[test]
    fn status_record_parses_hash_fields() {
        let fields = vec![
            ("status".to_string(), "running".to_string()),
            ("worker_id".to_string(), "worker-1".to_string()),
            ("attempts".to_string(), "2".to_string()),
            (
                "started_at".to_string(),
                "2026-08-01T10:00:00+00:00".to_string(),
            ),
        ];
        let record = TaskStatusRecord::from_fields(&fields).unwrap();
        assert_eq!(record.status, TaskState::Running);
        assert_eq!(record.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(record.attempts, 2);
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_none());

        assert!(TaskStatusRecord::from_fields(&[]).is_none());
    }
}
