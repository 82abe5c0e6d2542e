//! Cached record shape.

use crate::error::CacheError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redgate_core::TenantId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// A versioned, tagged cache record as persisted.
///
/// The version increases on every write through the cache API; tags
/// always include the owning tenant's implicit tag, which is what makes
/// whole-tenant invalidation possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub payload: serde_json::Value,
    pub version: u64,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
    pub size_bytes: u64,
}

impl CacheRecord {
    /// Builds a fresh record. Rejects non-positive TTLs.
    pub fn new(
        tenant: &TenantId,
        payload: serde_json::Value,
        ttl: Duration,
        tags: &[String],
        version: u64,
    ) -> Result<Self, CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        let now = Utc::now();
        let mut tag_set: BTreeSet<String> = tags.iter().cloned().collect();
        tag_set.insert(tenant.tag());

        let size_bytes = serde_json::to_vec(&payload).map(|v| v.len() as u64).unwrap_or(0);

        Ok(CacheRecord {
            payload,
            version,
            tags: tag_set,
            created_at: now,
            expires_at: now + ChronoDuration::milliseconds(ttl.as_millis() as i64),
            access_count: 0,
            last_access: now,
            size_bytes,
        })
    }

    /// Whether the record's own expiry has passed, regardless of the
    /// backing key's TTL.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Seconds left until expiry, for the backing store's TTL (rounded
    /// up).
    pub fn remaining_ttl_seconds(&self) -> u64 {
        let remaining_ms = (self.expires_at - Utc::now()).num_milliseconds();
        if remaining_ms <= 0 {
            0
        } else {
            (remaining_ms as u64).div_ceil(1000)
        }
    }

    /// Records a hit.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_access = Utc::now();
    }
}
