//! Agent configuration cache.
//!
//! Agent configs are deliberately not tenant-scoped: they describe the
//! backend's agent types, not any tenant's data. They are reachable only
//! through the admin path here, so tenant-scoped handles cannot touch
//! them and no pseudo-tenant needs inventing.

use crate::error::SubstrateError;
use redgate_connection::ConnectionFactory;
use redgate_core::keys;
use std::sync::Arc;

/// Cached per-agent-type configuration blobs.
pub struct AgentConfigStore {
    factory: Arc<ConnectionFactory>,
}

impl AgentConfigStore {
    pub fn new(factory: Arc<ConnectionFactory>) -> Self {
        Self { factory }
    }

    /// Stores the config blob for an agent type.
    pub async fn set(
        &self,
        agent_type: &str,
        config: serde_json::Value,
    ) -> Result<(), SubstrateError> {
        let key = keys::agent_config(agent_type).map_err(|e| SubstrateError::Config(e.to_string()))?;
        let json = serde_json::to_string(&config)
            .map_err(|e| SubstrateError::Config(e.to_string()))?;
        self.factory
            .with_admin_connection(|conn| async move { conn.set(&key, &json).await })
            .await?;
        Ok(())
    }

    /// The config blob for an agent type, if present.
    pub async fn get(&self, agent_type: &str) -> Result<Option<serde_json::Value>, SubstrateError> {
        let key = keys::agent_config(agent_type).map_err(|e| SubstrateError::Config(e.to_string()))?;
        let json = self
            .factory
            .with_admin_connection(|conn| async move { conn.get(&key).await })
            .await?;
        match json {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).map_err(|e| SubstrateError::Config(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Drops the config for an agent type. Returns whether it existed.
    pub async fn delete(&self, agent_type: &str) -> Result<bool, SubstrateError> {
        let key = keys::agent_config(agent_type).map_err(|e| SubstrateError::Config(e.to_string()))?;
        let removed = self
            .factory
            .with_admin_connection(|conn| async move { conn.del(&key).await })
            .await?;
        Ok(removed)
    }
}
