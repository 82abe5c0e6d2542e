//! Dead-letter store.
//!
//! Tasks that exhaust their retries (or fail non-retryably) are
//! snapshotted at `dead_letter_queue:task:<task-id>` under their tenant.
//! A periodic scan re-injects entries whose error shape looks transient
//! back into the live queue, with priority reset to Normal and a bounded
//! attempt budget.

use crate::error::QueueError;
use crate::queue::TaskQueue;
use crate::task::{Task, TaskKind, TaskPriority};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redgate_connection::ConnectionFactory;
use redgate_core::{keys, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Why a task ended up dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqCategory {
    RetryExhausted,
    InvalidData,
    SystemError,
}

impl DlqCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqCategory::RetryExhausted => "retry_exhausted",
            DlqCategory::InvalidData => "invalid_data",
            DlqCategory::SystemError => "system_error",
        }
    }
}

/// Operator-facing severity of a dead-lettered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl DlqSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqSeverity::Low => "low",
            DlqSeverity::Medium => "medium",
            DlqSeverity::High => "high",
            DlqSeverity::Critical => "critical",
        }
    }
}

/// Snapshot of a task that left the live queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterTask {
    pub original_task_id: Uuid,
    pub task_type: TaskKind,
    pub project_id: TenantId,
    pub priority: i32,
    pub data: serde_json::Value,
    pub error_message: String,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub severity: DlqSeverity,
    pub category: DlqCategory,
    pub auto_retry_eligible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_auto_retry_at: Option<DateTime<Utc>>,
}

/// Filters for [`DeadLetterQueue::list`].
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub severity: Option<DlqSeverity>,
    pub category: Option<DlqCategory>,
    pub limit: Option<usize>,
}

/// Aggregate dead-letter statistics for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DlqStats {
    pub total: u64,
    pub by_severity: HashMap<&'static str, u64>,
    pub by_category: HashMap<&'static str, u64>,
    pub auto_retry_eligible: u64,
}

/// Error shapes that auto-retry treats as transient.
const RETRYABLE_PATTERNS: [&str; 4] = ["timeout", "connection", "temporary", "rate limit"];

/// Kinds pre-approved for automatic re-injection.
const AUTO_RETRY_KINDS: [TaskKind; 3] = [
    TaskKind::EmbeddingComputation,
    TaskKind::AgentTask,
    TaskKind::DocumentExport,
];

/// Cumulative attempt ceiling beyond which auto-retry gives up.
const AUTO_RETRY_MAX_ATTEMPTS: u32 = 5;

/// Decides whether a dead-lettered task qualifies for automatic retry:
/// the error must match a transient pattern, the kind must be
/// pre-approved, and cumulative attempts must stay under the ceiling.
pub fn is_auto_retry_eligible(kind: TaskKind, error: &str, attempts: u32) -> bool {
    let error_lower = error.to_lowercase();
    if !RETRYABLE_PATTERNS.iter().any(|p| error_lower.contains(p)) {
        return false;
    }
    if !AUTO_RETRY_KINDS.contains(&kind) {
        return false;
    }
    attempts < AUTO_RETRY_MAX_ATTEMPTS
}

fn auto_retry_delay(attempts: u32) -> ChronoDuration {
    // Exponential in minutes, capped at one hour.
    ChronoDuration::minutes(2i64.saturating_pow(attempts).min(60))
}

/// The dead-letter store for all tenants.
pub struct DeadLetterQueue {
    factory: Arc<ConnectionFactory>,
}

impl DeadLetterQueue {
    pub fn new(factory: Arc<ConnectionFactory>) -> Self {
        Self { factory }
    }

    /// Records a dead-lettered task. An existing entry for the same task
    /// keeps its `first_failed_at` and accumulates the new failure.
    pub async fn add(
        &self,
        task: &Task,
        error: &str,
        attempts: u32,
        category: DlqCategory,
        severity: DlqSeverity,
    ) -> Result<DeadLetterTask, QueueError> {
        let now = Utc::now();
        let existing = self.get(&task.project_id, &task.task_id).await?;

        let eligible = is_auto_retry_eligible(task.task_type, error, attempts);
        let entry = DeadLetterTask {
            original_task_id: task.task_id,
            task_type: task.task_type,
            project_id: task.project_id,
            priority: task.priority.value(),
            data: task.data.clone(),
            error_message: error.to_string(),
            attempts,
            first_failed_at: existing.as_ref().map(|e| e.first_failed_at).unwrap_or(now),
            last_failed_at: now,
            severity,
            category,
            auto_retry_eligible: eligible,
            next_auto_retry_at: eligible.then(|| now + auto_retry_delay(attempts)),
        };

        let key = keys::dead_letter(&task.task_id);
        let stats_key = keys::dead_letter_stats();
        let json = serde_json::to_string(&entry)?;
        let is_new = existing.is_none();
        let severity_field = format!("severity:{}", severity.as_str());
        let category_field = format!("category:{}", category.as_str());

        self.factory
            .with_connection(&task.project_id, |conn| async move {
                conn.set(&key, &json).await?;
                if is_new {
                    conn.hincr_by(&stats_key, "total", 1).await?;
                    conn.hincr_by(&stats_key, &severity_field, 1).await?;
                    conn.hincr_by(&stats_key, &category_field, 1).await?;
                    conn.expire(&stats_key, 86400 * 7).await?;
                }
                Ok(())
            })
            .await?;

        if severity >= DlqSeverity::High {
            tracing::error!(
                task_id = %entry.original_task_id,
                kind = entry.task_type.as_str(),
                tenant = %entry.project_id,
                severity = severity.as_str(),
                category = category.as_str(),
                error = %entry.error_message,
                "task dead-lettered at high severity"
            );
        } else {
            tracing::warn!(
                task_id = %entry.original_task_id,
                category = category.as_str(),
                "task dead-lettered"
            );
        }

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "redgate_dlq_tasks_total",
            "category" => category.as_str(),
            "severity" => severity.as_str()
        )
        .increment(1);

        Ok(entry)
    }

    /// Fetches one entry.
    pub async fn get(
        &self,
        tenant: &TenantId,
        task_id: &Uuid,
    ) -> Result<Option<DeadLetterTask>, QueueError> {
        let key = keys::dead_letter(task_id);
        let json = self
            .factory
            .with_connection(tenant, |conn| async move { conn.get(&key).await })
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Lists entries for a tenant, newest failures first.
    pub async fn list(
        &self,
        tenant: &TenantId,
        filter: &DlqFilter,
    ) -> Result<Vec<DeadLetterTask>, QueueError> {
        let payloads = self
            .factory
            .with_connection(tenant, |conn| async move {
                let mut payloads = Vec::new();
                for key in conn.scan_match("dead_letter_queue:task:*").await? {
                    if let Some(json) = conn.get(&key).await? {
                        payloads.push(json);
                    }
                }
                Ok(payloads)
            })
            .await?;

        let mut entries = Vec::new();
        for payload in payloads {
            let entry: DeadLetterTask = match serde_json::from_str(&payload) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed dead-letter entry");
                    continue;
                }
            };
            if let Some(severity) = filter.severity {
                if entry.severity != severity {
                    continue;
                }
            }
            if let Some(category) = filter.category {
                if entry.category != category {
                    continue;
                }
            }
            entries.push(entry);
        }

        entries.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Removes one entry. Returns false when absent.
    pub async fn remove(&self, tenant: &TenantId, task_id: &Uuid) -> Result<bool, QueueError> {
        let key = keys::dead_letter(task_id);
        let removed = self
            .factory
            .with_connection(tenant, |conn| async move { conn.del(&key).await })
            .await?;
        Ok(removed)
    }

    /// Manually re-injects an entry into the live queue.
    pub async fn retry(
        &self,
        tenant: &TenantId,
        task_id: &Uuid,
        queue: &TaskQueue,
        priority: TaskPriority,
    ) -> Result<bool, QueueError> {
        let entry = match self.get(tenant, task_id).await? {
            Some(entry) => entry,
            None => return Ok(false),
        };
        let accepted = self.reinject(&entry, queue, priority).await?;
        if accepted {
            self.remove(tenant, task_id).await?;
        }
        Ok(accepted)
    }

    /// Aggregate statistics for a tenant.
    pub async fn statistics(&self, tenant: &TenantId) -> Result<DlqStats, QueueError> {
        let entries = self.list(tenant, &DlqFilter::default()).await?;
        let mut stats = DlqStats {
            total: entries.len() as u64,
            ..DlqStats::default()
        };
        for entry in &entries {
            *stats.by_severity.entry(entry.severity.as_str()).or_insert(0) += 1;
            *stats.by_category.entry(entry.category.as_str()).or_insert(0) += 1;
            if entry.auto_retry_eligible {
                stats.auto_retry_eligible += 1;
            }
        }
        Ok(stats)
    }

    /// Re-injects every entry whose auto-retry time has arrived. Returns
    /// how many went back into the live queue.
    pub async fn process_auto_retries(
        &self,
        tenant: &TenantId,
        queue: &TaskQueue,
    ) -> Result<u32, QueueError> {
        let now = Utc::now();
        let entries = self.list(tenant, &DlqFilter::default()).await?;
        let mut retried = 0;

        for entry in entries {
            if !entry.auto_retry_eligible {
                continue;
            }
            let due = entry.next_auto_retry_at.map(|at| at <= now).unwrap_or(false);
            if !due {
                continue;
            }
            if self.reinject(&entry, queue, TaskPriority::Normal).await? {
                self.remove(tenant, &entry.original_task_id).await?;
                retried += 1;
                tracing::info!(
                    task_id = %entry.original_task_id,
                    kind = entry.task_type.as_str(),
                    "auto-retried dead-lettered task"
                );
            }
        }
        Ok(retried)
    }

    /// Deletes entries whose last failure is older than `max_age_days`.
    pub async fn cleanup_old_tasks(
        &self,
        tenant: &TenantId,
        max_age_days: i64,
    ) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - ChronoDuration::days(max_age_days);
        let entries = self.list(tenant, &DlqFilter::default()).await?;
        let mut removed = 0;
        for entry in entries {
            if entry.last_failed_at < cutoff && self.remove(tenant, &entry.original_task_id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn reinject(
        &self,
        entry: &DeadLetterTask,
        queue: &TaskQueue,
        priority: TaskPriority,
    ) -> Result<bool, QueueError> {
        // Same identity, reset priority, bounded attempt budget. The
        // status hash keeps its cumulative attempt count, so eligibility
        // checks stay honest across re-injections.
        let task = Task {
            task_id: entry.original_task_id,
            task_type: entry.task_type,
            project_id: entry.project_id,
            priority,
            data: entry.data.clone(),
            created_at: Utc::now(),
            scheduled_at: None,
            timeout_seconds: 300,
            max_attempts: 3,
            metadata: serde_json::Map::new(),
        };
        Ok(queue.enqueue(&task).await?.is_accepted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_requires_transient_error() {
        assert!(is_auto_retry_eligible(
            TaskKind::AgentTask,
            "Connection refused by upstream",
            2
        ));
        assert!(is_auto_retry_eligible(
            TaskKind::EmbeddingComputation,
            "request timeout after 30s",
            0
        ));
        assert!(!is_auto_retry_eligible(
            TaskKind::AgentTask,
            "invalid payload shape",
            1
        ));
    }

    #[test]
    fn eligibility_requires_approved_kind() {
        assert!(!is_auto_retry_eligible(
            TaskKind::Notification,
            "timeout",
            1
        ));
        assert!(!is_auto_retry_eligible(TaskKind::Cleanup, "timeout", 1));
        assert!(is_auto_retry_eligible(
            TaskKind::DocumentExport,
            "timeout",
            1
        ));
    }

    #[test]
    fn eligibility_caps_cumulative_attempts() {
        assert!(is_auto_retry_eligible(TaskKind::AgentTask, "timeout", 4));
        assert!(!is_auto_retry_eligible(TaskKind::AgentTask, "timeout", 5));
        assert!(!is_auto_retry_eligible(TaskKind::AgentTask, "timeout", 9));
    }

    #[test]
    fn auto_retry_delay_backs_off_with_cap() {
        assert_eq!(auto_retry_delay(0), ChronoDuration::minutes(1));
        assert_eq!(auto_retry_delay(2), ChronoDuration::minutes(4));
        assert_eq!(auto_retry_delay(10), ChronoDuration::minutes(60));
    }
}
