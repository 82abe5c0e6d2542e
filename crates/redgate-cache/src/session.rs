//! Session store.
//!
//! One live session per user: creating a session revokes the user's
//! previous one. Validation slides the expiry forward by the default TTL,
//! so active sessions stay alive and idle ones lapse.

use crate::error::CacheError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redgate_connection::ConnectionFactory;
use redgate_core::{keys, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A user session as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub payload: serde_json::Value,
    /// Tenants this session has been granted access to, beyond its own.
    pub granted_projects: BTreeSet<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl Session {
    /// Valid means active and not yet expired.
    pub fn is_valid(&self) -> bool {
        self.active && Utc::now() < self.expires_at
    }

    pub fn has_project_access(&self, project: &Uuid) -> bool {
        self.granted_projects.contains(project)
    }

    fn remaining_ttl_seconds(&self) -> u64 {
        let remaining_ms = (self.expires_at - Utc::now()).num_milliseconds();
        if remaining_ms <= 0 {
            0
        } else {
            (remaining_ms as u64).div_ceil(1000)
        }
    }
}

/// Tenant-scoped session store with sliding expiration.
pub struct SessionStore {
    factory: Arc<ConnectionFactory>,
    default_ttl: Duration,
}

impl SessionStore {
    /// Default session lifetime: two hours, extended on every successful
    /// validation.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 3600);

    pub fn new(factory: Arc<ConnectionFactory>) -> Self {
        Self::with_ttl(factory, Self::DEFAULT_TTL)
    }

    pub fn with_ttl(factory: Arc<ConnectionFactory>, default_ttl: Duration) -> Self {
        Self {
            factory,
            default_ttl,
        }
    }

    /// Creates a session for the user, revoking any existing one
    /// (single-session policy).
    pub async fn create(
        &self,
        tenant: &TenantId,
        user_id: &Uuid,
        payload: serde_json::Value,
    ) -> Result<Session, CacheError> {
        if let Some(previous) = self.current_session_id(tenant, user_id).await? {
            self.revoke(tenant, &previous).await?;
            tracing::debug!(
                user_id = %user_id,
                previous_session = %previous,
                "revoked previous session on login"
            );
        }

        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4(),
            user_id: *user_id,
            payload,
            granted_projects: BTreeSet::new(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + ChronoDuration::milliseconds(self.default_ttl.as_millis() as i64),
            active: true,
        };

        self.persist(tenant, &session).await?;

        let pointer_key = keys::session_user(user_id);
        let session_id = session.session_id.to_string();
        let ttl = session.remaining_ttl_seconds().max(1);
        self.factory
            .with_connection(tenant, |conn| async move {
                conn.set_ex(&pointer_key, &session_id, ttl).await
            })
            .await?;

        tracing::info!(session_id = %session.session_id, user_id = %user_id, "session created");
        Ok(session)
    }

    /// Validates a session.
    ///
    /// Missing, revoked and expired sessions all return `None`. A valid
    /// session has its activity refreshed and its expiry extended by the
    /// default TTL before being returned.
    pub async fn validate(
        &self,
        tenant: &TenantId,
        session_id: &Uuid,
    ) -> Result<Option<Session>, CacheError> {
        let mut session = match self.get(tenant, session_id).await? {
            Some(session) => session,
            None => return Ok(None),
        };
        if !session.is_valid() {
            return Ok(None);
        }

        let now = Utc::now();
        session.last_activity_at = now;
        session.expires_at = now + ChronoDuration::milliseconds(self.default_ttl.as_millis() as i64);
        self.persist(tenant, &session).await?;

        Ok(Some(session))
    }

    /// Fetches a session without touching its expiry.
    pub async fn get(
        &self,
        tenant: &TenantId,
        session_id: &Uuid,
    ) -> Result<Option<Session>, CacheError> {
        let session_key = keys::session(session_id);
        let grants_key = keys::session_grants(session_id);
        let (json, grants) = self
            .factory
            .with_connection(tenant, |conn| async move {
                let json = conn.get(&session_key).await?;
                let grants = conn.smembers(&grants_key).await?;
                Ok((json, grants))
            })
            .await?;

        let Some(json) = json else {
            return Ok(None);
        };
        let mut session: Session = serde_json::from_str(&json)?;
        session.granted_projects = grants
            .iter()
            .filter_map(|g| Uuid::parse_str(g).ok())
            .collect();
        Ok(Some(session))
    }

    /// Revokes a session. Returns whether it existed.
    pub async fn revoke(&self, tenant: &TenantId, session_id: &Uuid) -> Result<bool, CacheError> {
        let mut session = match self.get(tenant, session_id).await? {
            Some(session) => session,
            None => return Ok(false),
        };
        session.active = false;
        self.persist(tenant, &session).await?;
        tracing::info!(session_id = %session_id, "session revoked");
        Ok(true)
    }

    /// Grants the session access to another tenant. The grant set is a
    /// separate Redis set, so concurrent grants do not clobber each
    /// other.
    pub async fn grant_project_access(
        &self,
        tenant: &TenantId,
        session_id: &Uuid,
        project: &Uuid,
    ) -> Result<bool, CacheError> {
        let session = match self.get(tenant, session_id).await? {
            Some(session) if session.is_valid() => session,
            _ => return Ok(false),
        };

        let grants_key = keys::session_grants(session_id);
        let member = project.to_string();
        let ttl = session.remaining_ttl_seconds().max(1) as i64;
        self.factory
            .with_connection(tenant, |conn| async move {
                conn.sadd(&grants_key, &[member]).await?;
                conn.expire(&grants_key, ttl).await?;
                Ok(())
            })
            .await?;
        Ok(true)
    }

    async fn current_session_id(
        &self,
        tenant: &TenantId,
        user_id: &Uuid,
    ) -> Result<Option<Uuid>, CacheError> {
        let pointer_key = keys::session_user(user_id);
        let id = self
            .factory
            .with_connection(tenant, |conn| async move { conn.get(&pointer_key).await })
            .await?;
        Ok(id.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    async fn persist(&self, tenant: &TenantId, session: &Session) -> Result<(), CacheError> {
        // Grants live in their own set; strip them from the JSON blob.
        let mut stored = session.clone();
        stored.granted_projects = BTreeSet::new();
        let json = serde_json::to_string(&stored)?;
        let session_key = keys::session(&session.session_id);
        let grants_key = keys::session_grants(&session.session_id);
        let ttl = session.remaining_ttl_seconds().max(1);

        self.factory
            .with_connection(tenant, |conn| async move {
                conn.set_ex(&session_key, &json, ttl).await?;
                conn.expire(&grants_key, ttl as i64).await?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redgate_connection::fake::{FakeConnector, FakeStore};
    use redgate_connection::ConnectionConfig;

    fn tenant() -> TenantId {
        TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb").unwrap()
    }

    async fn sessions_with_ttl(store: &FakeStore, ttl: Duration) -> SessionStore {
        let factory = ConnectionFactory::with_connector(
            ConnectionConfig::default(),
            Arc::new(FakeConnector::new(store.clone())),
        )
        .await
        .unwrap();
        SessionStore::with_ttl(factory, ttl)
    }

    #[tokio::test]
    async fn create_then_validate() {
        let store = FakeStore::new();
        let sessions = sessions_with_ttl(&store, Duration::from_secs(60)).await;
        let user = Uuid::new_v4();

        let session = sessions
            .create(&tenant(), &user, serde_json::json!({"role": "editor"}))
            .await
            .unwrap();
        assert!(session.is_valid());

        let validated = sessions
            .validate(&tenant(), &session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(validated.user_id, user);
        assert!(validated.expires_at >= session.expires_at);
    }

    #[tokio::test]
    async fn validation_slides_expiry_forward() {
        let store = FakeStore::new();
        let sessions = sessions_with_ttl(&store, Duration::from_secs(60)).await;
        let user = Uuid::new_v4();

        let session = sessions
            .create(&tenant(), &user, serde_json::json!({}))
            .await
            .unwrap();
        let initial_expiry = session.expires_at;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let validated = sessions
            .validate(&tenant(), &session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(validated.expires_at > initial_expiry);
    }

    #[tokio::test]
    async fn revoked_sessions_fail_validation() {
        let store = FakeStore::new();
        let sessions = sessions_with_ttl(&store, Duration::from_secs(60)).await;
        let user = Uuid::new_v4();

        let session = sessions
            .create(&tenant(), &user, serde_json::json!({}))
            .await
            .unwrap();
        assert!(sessions.revoke(&tenant(), &session.session_id).await.unwrap());
        assert!(sessions
            .validate(&tenant(), &session.session_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn missing_session_validates_to_none() {
        let store = FakeStore::new();
        let sessions = sessions_with_ttl(&store, Duration::from_secs(60)).await;
        assert!(sessions
            .validate(&tenant(), &Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn second_login_revokes_the_first_session() {
        let store = FakeStore::new();
        let sessions = sessions_with_ttl(&store, Duration::from_secs(60)).await;
        let user = Uuid::new_v4();

        let first = sessions
            .create(&tenant(), &user, serde_json::json!({}))
            .await
            .unwrap();
        let second = sessions
            .create(&tenant(), &user, serde_json::json!({}))
            .await
            .unwrap();

        assert!(sessions
            .validate(&tenant(), &first.session_id)
            .await
            .unwrap()
            .is_none());
        assert!(sessions
            .validate(&tenant(), &second.session_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn grants_accumulate() {
        let store = FakeStore::new();
        let sessions = sessions_with_ttl(&store, Duration::from_secs(60)).await;
        let user = Uuid::new_v4();
        let project_a = Uuid::new_v4();
        let project_b = Uuid::new_v4();

        let session = sessions
            .create(&tenant(), &user, serde_json::json!({}))
            .await
            .unwrap();
        sessions
            .grant_project_access(&tenant(), &session.session_id, &project_a)
            .await
            .unwrap();
        sessions
            .grant_project_access(&tenant(), &session.session_id, &project_b)
            .await
            .unwrap();

        let loaded = sessions
            .get(&tenant(), &session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.has_project_access(&project_a));
        assert!(loaded.has_project_access(&project_b));
    }
}
