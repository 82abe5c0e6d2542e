//! The connection factory.
//!
//! Multiplexes one logical Redis endpoint into an admin pool plus one
//! lazily-created pool per tenant, with every scope executing under the
//! shared circuit breaker. This is the only place connections are born;
//! components receive them as short-lived [`Connection`] scopes.

use crate::commands::Connector;
use crate::config::ConnectionConfig;
use crate::error::{CommandError, ConnectionError};
use crate::isolated::Connection;
use crate::pool::{Pool, PoolStats};
use crate::redis_backend::RedisConnector;
use crate::trace::CommandObserver;
use redgate_circuitbreaker::{BreakerStatus, CircuitBreaker, CircuitState};
use redgate_core::TenantId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Overall factory health, served by monitoring endpoints.
#[derive(Debug, Clone)]
pub struct FactoryHealth {
    pub healthy: bool,
    /// "healthy", "degraded" (breaker not closed) or "unhealthy".
    pub status: &'static str,
    pub breaker: BreakerStatus,
    pub ping_ms: Option<f64>,
    pub pools: Vec<PoolStats>,
    pub error: Option<String>,
}

pub struct ConnectionFactory {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    breaker: Arc<CircuitBreaker<ConnectionError>>,
    admin: Arc<Pool>,
    pools: RwLock<HashMap<TenantId, Arc<Pool>>>,
    observer: std::sync::RwLock<Option<Arc<dyn CommandObserver>>>,
    closed: AtomicBool,
}

impl ConnectionFactory {
    /// Connects to the configured Redis endpoint.
    ///
    /// Performs an initial PING through the circuit breaker;
    /// authentication failures are surfaced as [`ConnectionError::Auth`]
    /// and are fatal at startup.
    pub async fn connect(config: ConnectionConfig) -> Result<Arc<Self>, ConnectionError> {
        let connector = Arc::new(RedisConnector::new(
            config.url.clone(),
            config.connect_timeout,
        ));
        Self::with_connector(config, connector).await
    }

    /// Builds the factory over a custom [`Connector`].
    ///
    /// This is the seam tests use to substitute the in-memory fake store.
    pub async fn with_connector(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let breaker: Arc<CircuitBreaker<ConnectionError>> = Arc::new(
            CircuitBreaker::builder()
                .failure_threshold(config.breaker_failure_threshold)
                .recovery_timeout(config.breaker_recovery_timeout)
                .operation_timeout(config.operation_timeout)
                .failure_classifier(ConnectionError::is_breaker_classified)
                .name("redis")
                .build(),
        );

        let backend = connector.connect().await.map_err(map_startup_error)?;
        let admin = Arc::new(Pool::new("admin", backend, config.max_connections));

        let factory = Arc::new(Self {
            config,
            connector,
            breaker,
            admin,
            pools: RwLock::new(HashMap::new()),
            observer: std::sync::RwLock::new(None),
            closed: AtomicBool::new(false),
        });

        // Initial connection test through the breaker.
        factory
            .with_admin_connection(|conn| async move { conn.ping().await })
            .await?;

        tracing::info!(
            max_connections = factory.config.max_connections,
            tenant_pool_size = factory.config.tenant_pool_size(),
            "connection factory initialized"
        );

        Ok(factory)
    }

    /// Registers the command observer feeding health's latency histories.
    pub fn set_command_observer(&self, observer: Arc<dyn CommandObserver>) {
        *self.observer.write().expect("observer lock poisoned") = Some(observer);
    }

    /// The shared circuit breaker.
    pub fn breaker(&self) -> Arc<CircuitBreaker<ConnectionError>> {
        Arc::clone(&self.breaker)
    }

    /// Factory configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Runs `f` with a connection isolated to `tenant`.
    ///
    /// The tenant's pool is created lazily on first use. The whole scope
    /// executes under the circuit breaker and is bounded by the operation
    /// timeout.
    pub async fn with_connection<T, F, Fut>(
        &self,
        tenant: &TenantId,
        f: F,
    ) -> Result<T, ConnectionError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, ConnectionError>>,
    {
        self.ensure_open()?;
        let pool = self.tenant_pool(tenant).await?;
        let slot = pool.acquire(self.config.connect_timeout).await?;
        let conn = Connection::isolated(slot, *tenant, self.current_observer());

        self.breaker
            .call(move || f(conn))
            .await
            .map_err(ConnectionError::from)
    }

    /// Runs `f` with an admin connection: no tenant prefixing.
    ///
    /// Reserved for health sampling, script loading and agent
    /// configuration.
    pub async fn with_admin_connection<T, F, Fut>(&self, f: F) -> Result<T, ConnectionError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, ConnectionError>>,
    {
        self.ensure_open()?;
        let slot = self.admin.acquire(self.config.connect_timeout).await?;
        let conn = Connection::admin(slot, self.current_observer());

        self.breaker
            .call(move || f(conn))
            .await
            .map_err(ConnectionError::from)
    }

    /// Current stats for the admin pool and every tenant pool.
    pub async fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats = vec![self.admin.stats()];
        let pools = self.pools.read().await;
        let mut tenant_stats: Vec<PoolStats> = pools.values().map(|p| p.stats()).collect();
        tenant_stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats.extend(tenant_stats);
        stats
    }

    /// Pings the endpoint and reports overall health.
    pub async fn health_check(&self) -> FactoryHealth {
        let breaker = self.breaker.status().await;
        let pools = self.pool_stats().await;

        let start = std::time::Instant::now();
        let ping = self
            .with_admin_connection(|conn| async move { conn.ping().await })
            .await;

        match ping {
            Ok(()) => {
                let degraded = breaker.state != CircuitState::Closed;
                FactoryHealth {
                    healthy: !degraded,
                    status: if degraded { "degraded" } else { "healthy" },
                    breaker,
                    ping_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
                    pools,
                    error: None,
                }
            }
            Err(e) => FactoryHealth {
                healthy: false,
                status: "unhealthy",
                breaker,
                ping_ms: None,
                pools,
                error: Some(e.to_string()),
            },
        }
    }

    /// Closes the factory. Pools are dropped; subsequent scopes fail.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut pools = self.pools.write().await;
        pools.clear();
        tracing::info!("connection factory closed");
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Connection(
                "connection factory is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn current_observer(&self) -> Option<Arc<dyn CommandObserver>> {
        self.observer.read().expect("observer lock poisoned").clone()
    }

    async fn tenant_pool(&self, tenant: &TenantId) -> Result<Arc<Pool>, ConnectionError> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(tenant) {
                return Ok(Arc::clone(pool));
            }
        }

        // Connect outside the map lock; double-check on insert.
        let backend = self
            .breaker
            .call(|| async {
                self.connector
                    .connect()
                    .await
                    .map_err(ConnectionError::from)
            })
            .await
            .map_err(ConnectionError::from)?;

        let mut pools = self.pools.write().await;
        let pool = pools.entry(*tenant).or_insert_with(|| {
            tracing::debug!(
                tenant = %tenant,
                max_size = self.config.tenant_pool_size(),
                "created tenant connection pool"
            );
            Arc::new(Pool::new(
                tenant.to_string(),
                backend,
                self.config.tenant_pool_size(),
            ))
        });
        Ok(Arc::clone(pool))
    }
}

fn map_startup_error(e: CommandError) -> ConnectionError {
    match e {
        CommandError::Auth(msg) => ConnectionError::Auth(msg),
        other => ConnectionError::from(other),
    }
}

#[cfg(all(test, feature = "test-util"))]
mod tests {
    use super::*;
    use crate::fake::{FakeConnector, FakeStore};

    fn tenant() -> TenantId {
        TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb").unwrap()
    }

    async fn factory(store: &FakeStore) -> Arc<ConnectionFactory> {
        ConnectionFactory::with_connector(
            ConnectionConfig::default(),
            Arc::new(FakeConnector::new(store.clone())),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn tenant_scopes_are_prefixed_and_admin_is_raw() {
        let store = FakeStore::new();
        let factory = factory(&store).await;
        let t = tenant();

        factory
            .with_connection(&t, |conn| async move { conn.set("k", "v").await })
            .await
            .unwrap();

        let raw = factory
            .with_admin_connection(|conn| async move { conn.scan_match("*").await })
            .await
            .unwrap();

        assert_eq!(
            raw,
            vec![format!("proj:{t}:k")],
            "admin scan sees the fully-qualified key"
        );
    }

    #[tokio::test]
    async fn pools_are_created_lazily_and_sized() {
        let store = FakeStore::new();
        let factory = factory(&store).await;

        assert_eq!(factory.pool_stats().await.len(), 1); // admin only

        factory
            .with_connection(&tenant(), |conn| async move { conn.ping().await })
            .await
            .unwrap();

        let stats = factory.pool_stats().await;
        assert_eq!(stats.len(), 2);
        let tenant_pool = stats.iter().find(|s| s.name != "admin").unwrap();
        assert_eq!(
            tenant_pool.max_size,
            ConnectionConfig::default().tenant_pool_size()
        );
    }

    #[tokio::test]
    async fn health_check_reports_healthy() {
        let store = FakeStore::new();
        let factory = factory(&store).await;
        let health = factory.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.status, "healthy");
        assert!(health.ping_ms.is_some());
    }

    #[tokio::test]
    async fn closed_factory_rejects_scopes() {
        let store = FakeStore::new();
        let factory = factory(&store).await;
        factory.close().await;

        let err = factory
            .with_connection(&tenant(), |conn| async move { conn.ping().await })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Connection(_)));
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_failures() {
        let store = FakeStore::new();
        let factory = factory(&store).await;
        store.fail_with(CommandError::Connection("refused".to_string()));

        for _ in 0..ConnectionConfig::default().breaker_failure_threshold {
            let _ = factory
                .with_connection(&tenant(), |conn| async move { conn.ping().await })
                .await;
        }

        let err = factory
            .with_connection(&tenant(), |conn| async move { conn.ping().await })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::CircuitOpen));
    }
}
