use crate::entry::CacheRecord;
use crate::error::CacheError;
use redgate_connection::ConnectionFactory;
use redgate_core::{keys, TenantId};
use std::sync::Arc;
use std::time::Duration;

/// Default TTL for the project data/context convenience entries.
const PROJECT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Tenant-scoped data cache with versioning and tag invalidation.
///
/// Writes keep a secondary index from each tag to the keys carrying it,
/// updated alongside the entry, so tag invalidation is a set lookup
/// rather than a keyspace scan. Reads treat a stale `expires_at` as a
/// miss even if the backing key is still present.
pub struct TenantCache {
    factory: Arc<ConnectionFactory>,
}

impl TenantCache {
    pub fn new(factory: Arc<ConnectionFactory>) -> Self {
        Self { factory }
    }

    /// Writes an entry, bumping its version past any existing one.
    /// Returns the stored version.
    pub async fn write(
        &self,
        tenant: &TenantId,
        key: &str,
        payload: serde_json::Value,
        ttl: Duration,
        tags: &[String],
    ) -> Result<u64, CacheError> {
        let previous_version = self
            .read_raw(tenant, key)
            .await?
            .map(|r| r.version)
            .unwrap_or(0);
        let record = CacheRecord::new(tenant, payload, ttl, tags, previous_version + 1)?;

        let json = serde_json::to_string(&record)?;
        let ttl_seconds = record.remaining_ttl_seconds().max(1);
        let version = record.version;
        let logical_key = key.to_string();
        let tag_keys: Vec<(String, i64)> = record
            .tags
            .iter()
            .map(|tag| (keys::cache_tag(tag), ttl_seconds as i64))
            .collect();

        self.factory
            .with_connection(tenant, |conn| async move {
                conn.set_ex(&logical_key, &json, ttl_seconds).await?;
                for (tag_key, ttl) in &tag_keys {
                    conn.sadd(tag_key, &[logical_key.clone()]).await?;
                    // The index must outlive every member it points at;
                    // extend rather than shorten.
                    let current = conn.ttl(tag_key).await?;
                    if current < *ttl {
                        conn.expire(tag_key, *ttl).await?;
                    }
                }
                Ok(())
            })
            .await?;

        tracing::debug!(tenant = %tenant, key, version, "cache entry written");
        Ok(version)
    }

    /// Reads an entry; expired entries read as a miss. Hits update the
    /// access stats in place without extending the base TTL.
    pub async fn read(
        &self,
        tenant: &TenantId,
        key: &str,
    ) -> Result<Option<CacheRecord>, CacheError> {
        let record = match self.read_raw(tenant, key).await? {
            Some(record) => record,
            None => {
                self.record_outcome(false);
                return Ok(None);
            }
        };

        if record.is_expired() {
            self.delete(tenant, key).await?;
            self.record_outcome(false);
            return Ok(None);
        }

        let mut touched = record;
        touched.touch();
        let json = serde_json::to_string(&touched)?;
        let logical_key = key.to_string();
        self.factory
            .with_connection(tenant, |conn| async move {
                conn.set_keepttl(&logical_key, &json).await
            })
            .await?;

        self.record_outcome(true);
        Ok(Some(touched))
    }

    /// Deletes an entry and removes it from its tag indexes. Returns
    /// whether the entry existed.
    pub async fn delete(&self, tenant: &TenantId, key: &str) -> Result<bool, CacheError> {
        let record = self.read_raw(tenant, key).await?;
        let logical_key = key.to_string();
        let tag_keys: Vec<String> = record
            .map(|r| r.tags.iter().map(|t| keys::cache_tag(t)).collect())
            .unwrap_or_default();

        let removed = self
            .factory
            .with_connection(tenant, |conn| async move {
                for tag_key in &tag_keys {
                    conn.srem(tag_key, &[logical_key.clone()]).await?;
                }
                conn.del(&logical_key).await
            })
            .await?;
        Ok(removed)
    }

    /// Removes every entry carrying `tag`. Returns how many entries went
    /// away.
    pub async fn invalidate_tag(&self, tenant: &TenantId, tag: &str) -> Result<u64, CacheError> {
        let tag_key = keys::cache_tag(tag);
        let removed = self
            .factory
            .with_connection(tenant, |conn| async move {
                let members = conn.smembers(&tag_key).await?;
                let removed = if members.is_empty() {
                    0
                } else {
                    conn.del_many(&members).await?
                };
                conn.del(&tag_key).await?;
                Ok(removed)
            })
            .await?;

        tracing::debug!(tenant = %tenant, tag, removed, "invalidated cache entries by tag");
        Ok(removed)
    }

    /// Removes everything cached for the tenant via its implicit tag.
    pub async fn invalidate_tenant(&self, tenant: &TenantId) -> Result<u64, CacheError> {
        self.invalidate_tag(tenant, &tenant.tag()).await
    }

    /// Caches the tenant's project data blob.
    pub async fn cache_project_data(
        &self,
        tenant: &TenantId,
        data: serde_json::Value,
    ) -> Result<u64, CacheError> {
        self.write(
            tenant,
            &keys::project_data(tenant),
            data,
            PROJECT_CACHE_TTL,
            &["project_data".to_string()],
        )
        .await
    }

    /// The tenant's project data blob, if cached.
    pub async fn project_data(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<serde_json::Value>, CacheError> {
        Ok(self
            .read(tenant, &keys::project_data(tenant))
            .await?
            .map(|r| r.payload))
    }

    /// Caches the tenant's assembled context blob.
    pub async fn cache_project_context(
        &self,
        tenant: &TenantId,
        context: serde_json::Value,
    ) -> Result<u64, CacheError> {
        self.write(
            tenant,
            &keys::project_context(tenant),
            context,
            PROJECT_CACHE_TTL,
            &["project_context".to_string()],
        )
        .await
    }

    /// The tenant's context blob, if cached.
    pub async fn project_context(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<serde_json::Value>, CacheError> {
        Ok(self
            .read(tenant, &keys::project_context(tenant))
            .await?
            .map(|r| r.payload))
    }

    async fn read_raw(
        &self,
        tenant: &TenantId,
        key: &str,
    ) -> Result<Option<CacheRecord>, CacheError> {
        let logical_key = key.to_string();
        let json = self
            .factory
            .with_connection(tenant, |conn| async move { conn.get(&logical_key).await })
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn record_outcome(&self, hit: bool) {
        #[cfg(feature = "metrics")]
        metrics::counter!(
            "redgate_cache_reads_total",
            "outcome" => if hit { "hit" } else { "miss" }
        )
        .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = hit;
    }
}
