//! Substrate lifecycle.
//!
//! Startup order: connection factory (with its PING through the breaker),
//! script warm-up, then the background loops and worker pool. Shutdown
//! reverses it: workers drain first, loops get the signal and are
//! awaited, pools close last. All components are explicit dependencies
//! constructed here and handed out through accessors; nothing is a
//! process-wide singleton.

use crate::agents::AgentConfigStore;
use crate::config::SubstrateConfig;
use crate::error::SubstrateError;
use redgate_cache::{ProgressTracker, SessionStore, TenantCache};
use redgate_connection::{ConnectionFactory, Connector, FactoryHealth};
use redgate_core::TenantId;
use redgate_health::{AlertChannel, AlertManager, AlertRule, MetricsSampler};
use redgate_queue::{DeadLetterQueue, TaskHandler, TaskKind, TaskQueue, WorkerConfig, WorkerPool};
use redgate_ratelimiter::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Builder wiring handlers, workers and alerting into a [`Substrate`].
pub struct SubstrateBuilder {
    config: SubstrateConfig,
    connector: Option<Arc<dyn Connector>>,
    handlers: Vec<(TaskKind, Arc<dyn TaskHandler>)>,
    workers: Vec<WorkerConfig>,
    tenants: Vec<TenantId>,
    channels: Vec<Arc<dyn AlertChannel>>,
    rules: Option<Vec<AlertRule>>,
}

impl SubstrateBuilder {
    /// Registers the handler for a task kind.
    pub fn register_handler(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    /// Adds a worker to the pool.
    pub fn add_worker(mut self, worker: WorkerConfig) -> Self {
        self.workers.push(worker);
        self
    }

    /// Tenants the background scans (dead-letter auto-retry, cleanup)
    /// iterate over.
    pub fn serve_tenants(mut self, tenants: Vec<TenantId>) -> Self {
        self.tenants = tenants;
        self
    }

    /// Adds a notification channel for raised alerts.
    pub fn alert_channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Replaces the default alert rule set.
    pub fn alert_rules(mut self, rules: Vec<AlertRule>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Substitutes the store backend; the seam tests use to run the
    /// whole substrate against the in-memory fake.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Connects, warms up the scripts and starts every background loop.
    pub async fn start(self) -> Result<Substrate, SubstrateError> {
        let factory = match self.connector {
            Some(connector) => {
                ConnectionFactory::with_connector(self.config.connection.clone(), connector).await?
            }
            None => ConnectionFactory::connect(self.config.connection.clone()).await?,
        };

        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&factory),
            self.config.rate_limits.clone(),
        ));
        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&factory),
            self.config.queue.clone(),
        ));
        let dlq = Arc::new(DeadLetterQueue::new(Arc::clone(&factory)));
        let cache = Arc::new(TenantCache::new(Arc::clone(&factory)));
        let sessions = Arc::new(SessionStore::new(Arc::clone(&factory)));
        let progress = Arc::new(ProgressTracker::new(Arc::clone(&factory)));
        let agent_configs = Arc::new(AgentConfigStore::new(Arc::clone(&factory)));

        // Server-side scripts load once up front so the first request
        // never pays for it.
        limiter.warm_up().await?;
        queue.warm_up().await?;

        let sampler = MetricsSampler::new(Arc::clone(&factory), self.config.sampling_interval);
        let alerts = Arc::new(
            AlertManager::new(
                self.rules.unwrap_or_else(AlertManager::default_rules),
                self.channels,
            )
            .with_interval(self.config.alert_interval),
        );

        let mut workers = WorkerPool::new(Arc::clone(&queue), Arc::clone(&dlq));
        for (kind, handler) in self.handlers {
            workers.register_handler(kind, handler);
        }
        for worker in self.workers {
            workers.add_worker(worker);
        }
        let workers = Arc::new(workers);

        let (shutdown_tx, _) = watch::channel(false);
        let mut loops = Vec::new();

        loops.push(tokio::spawn(
            Arc::clone(&sampler).run(shutdown_tx.subscribe()),
        ));
        loops.push(tokio::spawn(Arc::clone(&alerts).run(
            Arc::clone(&sampler),
            shutdown_tx.subscribe(),
        )));
        loops.push(tokio::spawn(dlq_scan_loop(
            Arc::clone(&dlq),
            Arc::clone(&queue),
            self.tenants.clone(),
            self.config.dlq_scan_interval,
            shutdown_tx.subscribe(),
        )));
        loops.push(tokio::spawn(cleanup_loop(
            Arc::clone(&queue),
            Arc::clone(&limiter),
            Arc::clone(&dlq),
            self.tenants.clone(),
            self.config.cleanup_interval,
            shutdown_tx.subscribe(),
        )));

        workers.start();

        tracing::info!("substrate started");

        Ok(Substrate {
            factory,
            limiter,
            queue,
            dlq,
            cache,
            sessions,
            progress,
            agent_configs,
            sampler,
            alerts,
            workers,
            shutdown_tx,
            loops: std::sync::Mutex::new(loops),
        })
    }
}

/// The assembled substrate: every component plus the background loops.
pub struct Substrate {
    factory: Arc<ConnectionFactory>,
    limiter: Arc<RateLimiter>,
    queue: Arc<TaskQueue>,
    dlq: Arc<DeadLetterQueue>,
    cache: Arc<TenantCache>,
    sessions: Arc<SessionStore>,
    progress: Arc<ProgressTracker>,
    agent_configs: Arc<AgentConfigStore>,
    sampler: Arc<MetricsSampler>,
    alerts: Arc<AlertManager>,
    workers: Arc<WorkerPool>,
    shutdown_tx: watch::Sender<bool>,
    loops: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Substrate {
    /// Starts building a substrate over the given configuration.
    pub fn builder(config: SubstrateConfig) -> SubstrateBuilder {
        SubstrateBuilder {
            config,
            connector: None,
            handlers: Vec::new(),
            workers: Vec::new(),
            tenants: Vec::new(),
            channels: Vec::new(),
            rules: None,
        }
    }

    pub fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.factory
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn cache(&self) -> &Arc<TenantCache> {
        &self.cache
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn agent_configs(&self) -> &Arc<AgentConfigStore> {
        &self.agent_configs
    }

    pub fn sampler(&self) -> &Arc<MetricsSampler> {
        &self.sampler
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// Current endpoint health (PING, breaker, pools).
    pub async fn health(&self) -> FactoryHealth {
        self.factory.health_check().await
    }

    /// Graceful shutdown: drain workers, stop loops, close pools.
    pub async fn shutdown(&self) {
        tracing::info!("substrate shutting down");
        self.workers.shutdown().await;

        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.loops.lock().expect("loop handle lock poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background loop ended abnormally");
            }
        }

        self.factory.close().await;
        tracing::info!("substrate stopped");
    }
}

async fn dlq_scan_loop(
    dlq: Arc<DeadLetterQueue>,
    queue: Arc<TaskQueue>,
    tenants: Vec<TenantId>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for tenant in &tenants {
                    match dlq.process_auto_retries(tenant, &queue).await {
                        Ok(0) => {}
                        Ok(retried) => {
                            tracing::info!(tenant = %tenant, retried, "dead-letter auto-retry pass");
                        }
                        Err(e) => {
                            tracing::warn!(tenant = %tenant, error = %e, "dead-letter scan failed");
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("dead-letter scan loop stopped");
}

async fn cleanup_loop(
    queue: Arc<TaskQueue>,
    limiter: Arc<RateLimiter>,
    dlq: Arc<DeadLetterQueue>,
    tenants: Vec<TenantId>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for tenant in &tenants {
                    if let Err(e) = queue
                        .cleanup_expired(tenant, Duration::from_secs(86400))
                        .await
                    {
                        tracing::warn!(tenant = %tenant, error = %e, "task cleanup failed");
                    }
                    if let Err(e) = limiter
                        .cleanup_expired(tenant, Duration::from_secs(86400))
                        .await
                    {
                        tracing::warn!(tenant = %tenant, error = %e, "rate limit cleanup failed");
                    }
                    if let Err(e) = dlq.cleanup_old_tasks(tenant, 30).await {
                        tracing::warn!(tenant = %tenant, error = %e, "dead-letter cleanup failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("cleanup loop stopped");
}
