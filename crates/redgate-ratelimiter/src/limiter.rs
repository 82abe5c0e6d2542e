use crate::config::{normalize_path, LimitKind, RateLimitConfig, RateLimiterConfig};
use crate::error::RateLimitError;
use crate::scripts::{self, SLIDING_WINDOW, TOKEN_BUCKET};
use redgate_connection::{ConnectionFactory, ScriptExecutor};
use redgate_core::{keys, TenantId};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// The configured limit (window events or bucket capacity).
    pub limit: u64,
    /// Events counted in the current window after this check.
    pub current: u64,
    /// Checks left before denial.
    pub remaining: u64,
    /// When the window frees up.
    pub reset: Duration,
    /// Present on denials: how long the caller should wait.
    pub retry_after: Option<Duration>,
    pub kind: LimitKind,
    pub identifier: String,
}

impl RateLimitDecision {
    fn fail_open(kind: LimitKind, identifier: &str, config: &RateLimitConfig) -> Self {
        Self {
            allowed: true,
            limit: config.requests_per_window as u64,
            current: 0,
            remaining: config.requests_per_window as u64,
            reset: config.window,
            retry_after: None,
            kind,
            identifier: identifier.to_string(),
        }
    }
}

/// A request to admit, described by the identifiers it is checked against.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    pub user_id: Option<Uuid>,
    pub client_ip: Option<String>,
    /// Raw endpoint path; normalized before lookup.
    pub endpoint: Option<String>,
    /// Base request cost (reads 1, writes 2). Endpoint cost overrides
    /// replace it when configured.
    pub cost: u32,
}

/// Current usage for one sliding window, without consuming from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUsage {
    pub current: u64,
    pub oldest_event_ms: Option<u64>,
    pub newest_event_ms: Option<u64>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Distributed rate limiter over the shared connection factory.
///
/// Checks are atomic server-side scripts; when the store is unreachable or
/// the circuit breaker is open the limiter fails open: the request is
/// admitted and no counters move.
pub struct RateLimiter {
    factory: Arc<ConnectionFactory>,
    scripts: ScriptExecutor,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(factory: Arc<ConnectionFactory>, config: RateLimiterConfig) -> Self {
        Self {
            factory,
            scripts: ScriptExecutor::new(&[SLIDING_WINDOW, TOKEN_BUCKET]),
            config,
        }
    }

    /// Loads the rate-limiting scripts via the admin path.
    pub async fn warm_up(&self) -> Result<(), RateLimitError> {
        self.factory
            .with_admin_connection(|conn| async move { self.scripts.warm_up(&conn).await })
            .await?;
        Ok(())
    }

    /// Per-user check.
    pub async fn check_user(
        &self,
        tenant: &TenantId,
        user_id: &Uuid,
        cost: u32,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let config = self.config.user;
        self.check_sliding(tenant, LimitKind::User, &user_id.to_string(), config, cost)
            .await
    }

    /// Tenant-wide check.
    pub async fn check_project(
        &self,
        tenant: &TenantId,
        cost: u32,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let config = self.config.project;
        self.check_sliding(tenant, LimitKind::Project, &tenant.to_string(), config, cost)
            .await
    }

    /// Per-address check.
    pub async fn check_ip(
        &self,
        tenant: &TenantId,
        ip: &str,
        cost: u32,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let config = self.config.ip;
        self.check_sliding(tenant, LimitKind::Ip, ip, config, cost).await
    }

    /// Per-endpoint check; the path is normalized first and endpoint cost
    /// overrides replace the caller-supplied cost.
    pub async fn check_endpoint(
        &self,
        tenant: &TenantId,
        path: &str,
        cost: u32,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let normalized = normalize_path(path);
        let config = self.config.endpoint_limit(&normalized);
        let cost = self.config.endpoint_cost(&normalized).unwrap_or(cost);
        self.check_sliding(tenant, LimitKind::Endpoint, &normalized, config, cost)
            .await
    }

    /// Composite admission check: every applicable limit must pass, and the
    /// caller receives the most restrictive decision (lowest remaining).
    pub async fn check_request(
        &self,
        tenant: &TenantId,
        request: &RequestDescriptor,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let cost = request.cost.max(1);
        let mut decisions = Vec::new();

        if let Some(user_id) = &request.user_id {
            decisions.push(self.check_user(tenant, user_id, cost).await?);
        }
        decisions.push(self.check_project(tenant, cost).await?);
        if let Some(ip) = &request.client_ip {
            decisions.push(self.check_ip(tenant, ip, cost).await?);
        }
        if let Some(endpoint) = &request.endpoint {
            decisions.push(self.check_endpoint(tenant, endpoint, cost).await?);
        }

        let most_restrictive = decisions
            .into_iter()
            .min_by_key(|d| (d.allowed, d.remaining))
            .expect("at least the project check ran");
        Ok(most_restrictive)
    }

    /// Sliding-window check against an explicit configuration.
    pub async fn check_sliding(
        &self,
        tenant: &TenantId,
        kind: LimitKind,
        identifier: &str,
        config: RateLimitConfig,
        cost: u32,
    ) -> Result<RateLimitDecision, RateLimitError> {
        if cost < 1 {
            return Err(RateLimitError::InvalidCost(cost));
        }
        keys::validate_identifier(identifier)?;

        let key = keys::rate_limit_sliding(kind.as_str(), identifier, config.window.as_secs());
        let args = vec![
            config.window.as_millis().to_string(),
            now_ms().to_string(),
            cost.to_string(),
            config.requests_per_window.to_string(),
        ];

        let result = self
            .factory
            .with_connection(tenant, |conn| async move {
                self.scripts
                    .invoke(&conn, SLIDING_WINDOW.name, &[key], &args)
                    .await
            })
            .await;

        match result {
            Ok(reply) => {
                let decoded = scripts::decode_sliding(reply)?;
                let decision = RateLimitDecision {
                    allowed: decoded.allowed,
                    limit: decoded.limit,
                    current: decoded.current,
                    remaining: decoded.remaining,
                    reset: Duration::from_secs(decoded.reset_seconds),
                    retry_after: (!decoded.allowed)
                        .then(|| Duration::from_secs(decoded.reset_seconds)),
                    kind,
                    identifier: identifier.to_string(),
                };
                self.record_decision(&decision);
                Ok(decision)
            }
            Err(e) if e.is_unavailable() => Ok(self.fail_open(kind, identifier, &config, &e)),
            Err(e) => Err(e.into()),
        }
    }

    /// Token-bucket check for burst-shaped limits.
    pub async fn check_token_bucket(
        &self,
        tenant: &TenantId,
        identifier: &str,
        capacity: u32,
        refill_rate: f64,
        cost: u32,
    ) -> Result<RateLimitDecision, RateLimitError> {
        if cost < 1 {
            return Err(RateLimitError::InvalidCost(cost));
        }
        keys::validate_identifier(identifier)?;

        let key = keys::rate_limit_bucket(identifier);
        let args = vec![
            capacity.to_string(),
            refill_rate.to_string(),
            now_ms().to_string(),
            cost.to_string(),
        ];

        let result = self
            .factory
            .with_connection(tenant, |conn| async move {
                self.scripts
                    .invoke(&conn, TOKEN_BUCKET.name, &[key], &args)
                    .await
            })
            .await;

        match result {
            Ok(reply) => {
                let decoded = scripts::decode_bucket(reply)?;
                let decision = RateLimitDecision {
                    allowed: decoded.allowed,
                    limit: decoded.capacity,
                    current: decoded.capacity.saturating_sub(decoded.tokens),
                    remaining: decoded.tokens,
                    reset: Duration::from_secs(decoded.retry_after_seconds),
                    retry_after: (!decoded.allowed)
                        .then(|| Duration::from_secs(decoded.retry_after_seconds)),
                    kind: LimitKind::User,
                    identifier: identifier.to_string(),
                };
                self.record_decision(&decision);
                Ok(decision)
            }
            Err(e) if e.is_unavailable() => {
                let approx = RateLimitConfig::new(capacity, Duration::from_secs(1));
                Ok(self.fail_open(LimitKind::User, identifier, &approx, &e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current usage for a sliding window, without consuming from it.
    pub async fn status(
        &self,
        tenant: &TenantId,
        kind: LimitKind,
        identifier: &str,
        window: Duration,
    ) -> Result<WindowUsage, RateLimitError> {
        keys::validate_identifier(identifier)?;
        let key = keys::rate_limit_sliding(kind.as_str(), identifier, window.as_secs());
        let window_start = now_ms().saturating_sub(window.as_millis() as u64) as f64;

        let usage = self
            .factory
            .with_connection(tenant, |conn| async move {
                let current = conn.zcount(&key, window_start, f64::MAX).await?;
                let range = conn.zrange_withscores(&key, 0, -1).await?;
                let oldest = range.first().map(|(_, s)| *s as u64);
                let newest = range.last().map(|(_, s)| *s as u64);
                Ok(WindowUsage {
                    current,
                    oldest_event_ms: oldest,
                    newest_event_ms: newest,
                })
            })
            .await?;
        Ok(usage)
    }

    /// Clears the window for an identifier.
    pub async fn reset(
        &self,
        tenant: &TenantId,
        kind: LimitKind,
        identifier: &str,
        window: Duration,
    ) -> Result<bool, RateLimitError> {
        keys::validate_identifier(identifier)?;
        let key = keys::rate_limit_sliding(kind.as_str(), identifier, window.as_secs());
        let removed = self
            .factory
            .with_connection(tenant, |conn| async move { conn.del(&key).await })
            .await?;
        Ok(removed)
    }

    /// Deletes sliding windows whose newest event is older than `max_age`.
    ///
    /// Windows normally evict via their TTL; this pass is a backstop run
    /// from the orchestrator's cleanup loop.
    pub async fn cleanup_expired(
        &self,
        tenant: &TenantId,
        max_age: Duration,
    ) -> Result<u64, RateLimitError> {
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64) as f64;
        let removed = self
            .factory
            .with_connection(tenant, |conn| async move {
                let mut removed = 0;
                for key in conn.scan_match("rate_limit:*").await? {
                    if key.starts_with("rate_limit:token_bucket:") {
                        continue;
                    }
                    let newest = conn.zrange_withscores(&key, -1, -1).await?;
                    match newest.first() {
                        Some((_, score)) if *score < cutoff => {
                            conn.del(&key).await?;
                            removed += 1;
                        }
                        None => {
                            conn.del(&key).await?;
                            removed += 1;
                        }
                        _ => {}
                    }
                }
                Ok(removed)
            })
            .await?;
        Ok(removed)
    }

    fn fail_open(
        &self,
        kind: LimitKind,
        identifier: &str,
        config: &RateLimitConfig,
        error: &redgate_connection::ConnectionError,
    ) -> RateLimitDecision {
        tracing::warn!(
            kind = kind.as_str(),
            identifier,
            error = %error,
            "rate limit store unavailable; failing open"
        );

        #[cfg(feature = "metrics")]
        metrics::counter!("redgate_rate_limit_fail_open_total", "kind" => kind.as_str())
            .increment(1);

        RateLimitDecision::fail_open(kind, identifier, config)
    }

    fn record_decision(&self, decision: &RateLimitDecision) {
        tracing::debug!(
            kind = decision.kind.as_str(),
            identifier = %decision.identifier,
            allowed = decision.allowed,
            current = decision.current,
            remaining = decision.remaining,
            "rate limit decision"
        );

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "redgate_rate_limit_decisions_total",
            "kind" => decision.kind.as_str(),
            "outcome" => if decision.allowed { "allowed" } else { "denied" }
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redgate_connection::fake::{FakeConnector, FakeStore};
    use redgate_connection::{CommandError, ConnectionConfig};

    fn tenant() -> TenantId {
        TenantId::parse("6f7deacc-9d74-4984-a6ae-d0a78597bbcb").unwrap()
    }

    async fn limiter(store: &FakeStore) -> RateLimiter {
        let factory = ConnectionFactory::with_connector(
            ConnectionConfig::default(),
            Arc::new(FakeConnector::new(store.clone())),
        )
        .await
        .unwrap();
        RateLimiter::new(factory, RateLimiterConfig::default())
    }

    #[tokio::test]
    async fn allows_until_limit_then_denies_with_reset() {
        let store = FakeStore::new();
        let limiter = limiter(&store).await;
        let config = RateLimitConfig::new(3, Duration::from_secs(60));

        for i in 1..=3 {
            let decision = limiter
                .check_sliding(&tenant(), LimitKind::User, "u-1", config, 1)
                .await
                .unwrap();
            assert!(decision.allowed, "check {i} should be allowed");
            assert_eq!(decision.current, i);
        }

        let denied = limiter
            .check_sliding(&tenant(), LimitKind::User, "u-1", config, 1)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.current, 3);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset > Duration::ZERO);
        assert!(denied.retry_after.is_some());
    }

    #[tokio::test]
    async fn cost_spends_multiple_slots() {
        let store = FakeStore::new();
        let limiter = limiter(&store).await;
        let config = RateLimitConfig::new(5, Duration::from_secs(60));

        let decision = limiter
            .check_sliding(&tenant(), LimitKind::User, "u-1", config, 2)
            .await
            .unwrap();
        assert_eq!(decision.current, 2);
        assert_eq!(decision.remaining, 3);

        let denied = limiter
            .check_sliding(&tenant(), LimitKind::User, "u-1", config, 4)
            .await
            .unwrap();
        assert!(!denied.allowed);
    }

    #[tokio::test]
    async fn zero_cost_is_rejected_before_io() {
        let store = FakeStore::new();
        let limiter = limiter(&store).await;
        store.clear_touched();

        let err = limiter
            .check_sliding(
                &tenant(),
                LimitKind::User,
                "u-1",
                RateLimitConfig::new(5, Duration::from_secs(60)),
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidCost(0)));
        assert!(store.touched_keys().is_empty());
    }

    #[tokio::test]
    async fn token_bucket_drains_and_reports_retry() {
        let store = FakeStore::new();
        let limiter = limiter(&store).await;

        let first = limiter
            .check_token_bucket(&tenant(), "u-1", 10, 1.0, 10)
            .await
            .unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 0);

        let denied = limiter
            .check_token_bucket(&tenant(), "u-1", 10, 1.0, 10)
            .await
            .unwrap();
        assert!(!denied.allowed);
        let retry = denied.retry_after.unwrap();
        assert!(retry >= Duration::from_secs(1) && retry <= Duration::from_secs(11));
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let store = FakeStore::new();
        let limiter = limiter(&store).await;
        store.fail_with(CommandError::Connection("down".to_string()));

        let decision = limiter
            .check_sliding(
                &tenant(),
                LimitKind::User,
                "u-1",
                RateLimitConfig::new(3, Duration::from_secs(60)),
                1,
            )
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
    }

    #[tokio::test]
    async fn composite_returns_most_restrictive() {
        let store = FakeStore::new();
        let factory = ConnectionFactory::with_connector(
            ConnectionConfig::default(),
            Arc::new(FakeConnector::new(store.clone())),
        )
        .await
        .unwrap();
        let limiter = RateLimiter::new(
            factory,
            RateLimiterConfig::builder()
                .ip_limit(RateLimitConfig::new(2, Duration::from_secs(60)))
                .build(),
        );

        let request = RequestDescriptor {
            user_id: Some(Uuid::new_v4()),
            client_ip: Some("10.0.0.1".to_string()),
            endpoint: None,
            cost: 1,
        };

        let decision = limiter.check_request(&tenant(), &request).await.unwrap();
        assert!(decision.allowed);
        // The tight ip limit (2/min) is the binding one.
        assert_eq!(decision.kind, LimitKind::Ip);
        assert_eq!(decision.remaining, 1);

        limiter.check_request(&tenant(), &request).await.unwrap();
        let denied = limiter.check_request(&tenant(), &request).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.kind, LimitKind::Ip);
    }

    #[tokio::test]
    async fn endpoint_cost_override_applies() {
        let store = FakeStore::new();
        let factory = ConnectionFactory::with_connector(
            ConnectionConfig::default(),
            Arc::new(FakeConnector::new(store.clone())),
        )
        .await
        .unwrap();
        let limiter = RateLimiter::new(
            factory,
            RateLimiterConfig::builder()
                // Overrides are keyed on the normalized path.
                .endpoint_limit(
                    "/api/v1/documents/id",
                    RateLimitConfig::new(10, Duration::from_secs(60)),
                )
                .endpoint_cost("/api/v1/documents/id", 5)
                .build(),
        );

        let decision = limiter
            .check_endpoint(&tenant(), "/api/v1/documents/42", 1)
            .await
            .unwrap();
        assert_eq!(decision.identifier, "/api/v1/documents/id");
        assert_eq!(decision.limit, 10);
        assert_eq!(decision.current, 5);
    }

    #[tokio::test]
    async fn reset_clears_the_window() {
        let store = FakeStore::new();
        let limiter = limiter(&store).await;
        let config = RateLimitConfig::new(1, Duration::from_secs(60));

        limiter
            .check_sliding(&tenant(), LimitKind::User, "u-1", config, 1)
            .await
            .unwrap();
        let denied = limiter
            .check_sliding(&tenant(), LimitKind::User, "u-1", config, 1)
            .await
            .unwrap();
        assert!(!denied.allowed);

        limiter
            .reset(&tenant(), LimitKind::User, "u-1", config.window)
            .await
            .unwrap();

        let again = limiter
            .check_sliding(&tenant(), LimitKind::User, "u-1", config, 1)
            .await
            .unwrap();
        assert!(again.allowed);
    }
}
