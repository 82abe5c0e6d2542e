//! Tenant identity.
//!
//! Every operation the substrate performs executes under a tenant, and every
//! key it stores is namespaced by that tenant. A tenant is any valid UUID;
//! validation happens at construction so no I/O is ever attempted with a
//! malformed tenant.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Returned when a string does not parse as a tenant UUID.
///
/// Callers at the connection boundary surface this as an isolation
/// violation, before any Redis I/O takes place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid tenant id {0:?}: must be a UUID")]
pub struct InvalidTenant(pub String);

/// A unit of isolation, identified by a UUID.
///
/// Renders as the 36-character lowercase hyphenated form everywhere it is
/// displayed or serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    /// The tenant carried by infrastructure-wide alerts (the nil UUID).
    ///
    /// This is a documented constant, not a magic value invented per call
    /// site: components that report on the Redis endpoint itself rather
    /// than on one tenant's data attribute their alerts to it. The
    /// connection factory treats it like any other tenant.
    pub const SYSTEM: TenantId = TenantId(Uuid::nil());

    /// Wraps an already-validated UUID.
    pub fn new(id: Uuid) -> Self {
        TenantId(id)
    }

    /// Generates a fresh random tenant id.
    pub fn random() -> Self {
        TenantId(Uuid::new_v4())
    }

    /// Parses a tenant id from its string form.
    pub fn parse(s: &str) -> Result<Self, InvalidTenant> {
        Uuid::parse_str(s)
            .map(TenantId)
            .map_err(|_| InvalidTenant(s.to_string()))
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The key prefix applied to every key stored under this tenant.
    pub fn key_prefix(&self) -> String {
        format!("proj:{}:", self.0)
    }

    /// The implicit cache tag carried by every cache entry of this tenant.
    pub fn tag(&self) -> String {
        format!("tenant:{}", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Uuid's Display is the lowercase hyphenated form.
        self.0.fmt(f)
    }
}

impl FromStr for TenantId {
    type Err = InvalidTenant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TenantId::parse(s)
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        TenantId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_uuid() {
        let tenant = TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb").unwrap();
        assert_eq!(tenant.to_string(), "6f7deacc-9d74-4984-a6ae-d0a78597bbcb");
    }

    #[test]
    fn rejects_non_uuid() {
        let err = TenantId::parse("not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("not-a-uuid"));
    }

    #[test]
    fn key_prefix_is_namespaced() {
        let tenant = TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb").unwrap();
        assert_eq!(
            tenant.key_prefix(),
            "proj:6f7deacc-9d74-4984-a6ae-d0a78597bbcb:"
        );
    }

    #[test]
    fn system_tenant_is_nil() {
        assert_eq!(
            TenantId::SYSTEM.to_string(),
            "00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn serializes_as_plain_string() {
        let tenant = TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb").unwrap();
        let json = serde_json::to_string(&tenant).unwrap();
        assert_eq!(json, "\"6f7deacc-9d74-4984-a6ae-d0a78597bbcb\"");
        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tenant);
    }
}
