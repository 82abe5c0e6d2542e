//! Progress trackers for long-running operations.
//!
//! A tracker moves through `active` to exactly one of `completed` or
//! `failed`; finished trackers cannot be reopened. Every mutation
//! persists the full tracker and refreshes its TTL so abandoned trackers
//! evict on their own.

use crate::error::CacheError;
use chrono::{DateTime, Utc};
use redgate_connection::ConnectionFactory;
use redgate_core::{keys, TenantId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state derived from the tracker's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Active,
    Completed,
    Failed,
}

/// One logged step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEntry {
    pub step: u32,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A progress tracker as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub correlation_id: Uuid,
    pub total_steps: u32,
    pub current_step: u32,
    pub message: String,
    pub step_log: Vec<StepEntry>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Progress {
    pub fn state(&self) -> ProgressState {
        if self.error.is_some() {
            ProgressState::Failed
        } else if self.completed_at.is_some() {
            ProgressState::Completed
        } else {
            ProgressState::Active
        }
    }

    fn is_finished(&self) -> bool {
        self.state() != ProgressState::Active
    }
}

/// Store for progress trackers.
pub struct ProgressTracker {
    factory: Arc<ConnectionFactory>,
    ttl: Duration,
}

impl ProgressTracker {
    /// Default tracker TTL, refreshed on every mutation.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

    pub fn new(factory: Arc<ConnectionFactory>) -> Self {
        Self::with_ttl(factory, Self::DEFAULT_TTL)
    }

    pub fn with_ttl(factory: Arc<ConnectionFactory>, ttl: Duration) -> Self {
        Self { factory, ttl }
    }

    /// Starts a tracker. `total_steps` must be positive.
    pub async fn start(
        &self,
        tenant: &TenantId,
        correlation_id: &Uuid,
        total_steps: u32,
    ) -> Result<Progress, CacheError> {
        if total_steps == 0 {
            return Err(CacheError::InvalidTotalSteps);
        }
        let now = Utc::now();
        let progress = Progress {
            correlation_id: *correlation_id,
            total_steps,
            current_step: 0,
            message: String::new(),
            step_log: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        };
        self.persist(tenant, &progress).await?;
        Ok(progress)
    }

    /// Moves the tracker to `step` (0..=total) with a message.
    pub async fn update_step(
        &self,
        tenant: &TenantId,
        correlation_id: &Uuid,
        step: u32,
        message: &str,
    ) -> Result<Progress, CacheError> {
        let mut progress = self.load(tenant, correlation_id).await?;
        if progress.is_finished() {
            return Err(CacheError::ProgressFinished(*correlation_id));
        }
        if step > progress.total_steps {
            return Err(CacheError::StepOutOfRange {
                step,
                total: progress.total_steps,
            });
        }

        let now = Utc::now();
        progress.current_step = step;
        progress.message = message.to_string();
        progress.updated_at = now;
        progress.step_log.push(StepEntry {
            step,
            message: message.to_string(),
            at: now,
        });
        self.persist(tenant, &progress).await?;
        Ok(progress)
    }

    /// Advances by one step.
    pub async fn increment(
        &self,
        tenant: &TenantId,
        correlation_id: &Uuid,
        message: &str,
    ) -> Result<Progress, CacheError> {
        let progress = self.load(tenant, correlation_id).await?;
        let next = (progress.current_step + 1).min(progress.total_steps);
        self.update_step(tenant, correlation_id, next, message).await
    }

    /// Marks the tracker completed. Terminal.
    pub async fn complete(
        &self,
        tenant: &TenantId,
        correlation_id: &Uuid,
        message: &str,
    ) -> Result<Progress, CacheError> {
        let mut progress = self.load(tenant, correlation_id).await?;
        if progress.is_finished() {
            return Err(CacheError::ProgressFinished(*correlation_id));
        }
        let now = Utc::now();
        progress.current_step = progress.total_steps;
        progress.message = message.to_string();
        progress.updated_at = now;
        progress.completed_at = Some(now);
        self.persist(tenant, &progress).await?;
        Ok(progress)
    }

    /// Marks the tracker failed. Terminal.
    pub async fn fail(
        &self,
        tenant: &TenantId,
        correlation_id: &Uuid,
        error: &str,
    ) -> Result<Progress, CacheError> {
        let mut progress = self.load(tenant, correlation_id).await?;
        if progress.is_finished() {
            return Err(CacheError::ProgressFinished(*correlation_id));
        }
        let now = Utc::now();
        progress.updated_at = now;
        progress.completed_at = Some(now);
        progress.error = Some(error.to_string());
        self.persist(tenant, &progress).await?;
        Ok(progress)
    }

    /// Fetches a tracker, if present.
    pub async fn get(
        &self,
        tenant: &TenantId,
        correlation_id: &Uuid,
    ) -> Result<Option<Progress>, CacheError> {
        let key = keys::progress(correlation_id);
        let json = self
            .factory
            .with_connection(tenant, |conn| async move { conn.get(&key).await })
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn load(&self, tenant: &TenantId, correlation_id: &Uuid) -> Result<Progress, CacheError> {
        self.get(tenant, correlation_id)
            .await?
            .ok_or(CacheError::ProgressNotFound(*correlation_id))
    }

    async fn persist(&self, tenant: &TenantId, progress: &Progress) -> Result<(), CacheError> {
        let key = keys::progress(&progress.correlation_id);
        let json = serde_json::to_string(progress)?;
        let ttl = self.ttl.as_secs().max(1);
        self.factory
            .with_connection(tenant, |conn| async move {
                conn.set_ex(&key, &json, ttl).await
            })
            .await?;
        Ok(())
    }
}
