use std::collections::HashMap;
use std::time::Duration;

/// Cost of a read-style request.
pub const READ_COST: u32 = 1;
/// Cost of a write-style request.
pub const WRITE_COST: u32 = 2;

/// The kinds of identifiers a request is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    /// Per-user limit.
    User,
    /// Tenant-wide limit.
    Project,
    /// Per-client-address limit.
    Ip,
    /// Per-endpoint limit, keyed on the normalized path.
    Endpoint,
}

impl LimitKind {
    /// Key segment for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::User => "user",
            LimitKind::Project => "project",
            LimitKind::Ip => "ip",
            LimitKind::Endpoint => "endpoint",
        }
    }
}

/// One sliding-window limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Accepted events per window.
    pub requests_per_window: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(requests_per_window: u32, window: Duration) -> Self {
        Self {
            requests_per_window,
            window,
        }
    }
}

/// Limiter-wide configuration: per-kind defaults plus endpoint overrides.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub(crate) user: RateLimitConfig,
    pub(crate) project: RateLimitConfig,
    pub(crate) ip: RateLimitConfig,
    pub(crate) endpoints: HashMap<String, RateLimitConfig>,
    pub(crate) endpoint_costs: HashMap<String, u32>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "/api/v1/documents".to_string(),
            RateLimitConfig::new(50, Duration::from_secs(60)),
        );
        endpoints.insert(
            "/api/v1/agents".to_string(),
            RateLimitConfig::new(20, Duration::from_secs(60)),
        );
        endpoints.insert(
            "/api/v1/projects".to_string(),
            RateLimitConfig::new(30, Duration::from_secs(60)),
        );

        Self {
            user: RateLimitConfig::new(1000, Duration::from_secs(3600)),
            project: RateLimitConfig::new(5000, Duration::from_secs(3600)),
            ip: RateLimitConfig::new(100, Duration::from_secs(60)),
            endpoints,
            endpoint_costs: HashMap::new(),
        }
    }
}

impl RateLimiterConfig {
    /// Returns a new builder with the default limits.
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder {
            config: Self::default(),
        }
    }

    pub(crate) fn endpoint_limit(&self, normalized_path: &str) -> RateLimitConfig {
        self.endpoints
            .get(normalized_path)
            .copied()
            .unwrap_or(self.user)
    }

    pub(crate) fn endpoint_cost(&self, normalized_path: &str) -> Option<u32> {
        self.endpoint_costs.get(normalized_path).copied()
    }
}

/// Builder for [`RateLimiterConfig`].
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    /// Sets the per-user limit.
    ///
    /// Default: 1000 requests per hour
    pub fn user_limit(mut self, limit: RateLimitConfig) -> Self {
        self.config.user = limit;
        self
    }

    /// Sets the tenant-wide limit.
    ///
    /// Default: 5000 requests per hour
    pub fn project_limit(mut self, limit: RateLimitConfig) -> Self {
        self.config.project = limit;
        self
    }

    /// Sets the per-address limit.
    ///
    /// Default: 100 requests per minute
    pub fn ip_limit(mut self, limit: RateLimitConfig) -> Self {
        self.config.ip = limit;
        self
    }

    /// Overrides the limit for one endpoint (normalized path).
    pub fn endpoint_limit(mut self, path: impl Into<String>, limit: RateLimitConfig) -> Self {
        self.config.endpoints.insert(path.into(), limit);
        self
    }

    /// Sets an elevated request cost for one endpoint.
    pub fn endpoint_cost(mut self, path: impl Into<String>, cost: u32) -> Self {
        self.config.endpoint_costs.insert(path.into(), cost);
        self
    }

    pub fn build(self) -> RateLimiterConfig {
        self.config
    }
}

/// Normalizes an endpoint path: dynamic segments (UUIDs and numeric ids)
/// collapse to `id`, so `/api/v1/documents/42` and
/// `/api/v1/documents/7c9e...` share one limit.
pub fn normalize_path(path: &str) -> String {
    let normalized: Vec<&str> = path
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                segment
            } else if uuid::Uuid::parse_str(segment).is_ok()
                || segment.chars().all(|c| c.is_ascii_digit())
            {
                "id"
            } else {
                segment
            }
        })
        .collect();
    normalized.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dynamic_segments() {
        assert_eq!(
            normalize_path("/api/v1/documents/42"),
            "/api/v1/documents/id"
        );
        assert_eq!(
            normalize_path("/api/v1/projects/7c9e6679-7425-40de-944b-e07fc1f90ae7/export"),
            "/api/v1/projects/id/export"
        );
        assert_eq!(normalize_path("/api/v1/agents"), "/api/v1/agents");
    }

    #[test]
    fn endpoint_limits_fall_back_to_user_default() {
        let config = RateLimiterConfig::default();
        assert_eq!(
            config.endpoint_limit("/api/v1/agents").requests_per_window,
            20
        );
        assert_eq!(
            config.endpoint_limit("/api/v1/unknown").requests_per_window,
            1000
        );
    }

    #[test]
    fn builder_overrides_apply() {
        let config = RateLimiterConfig::builder()
            .ip_limit(RateLimitConfig::new(10, Duration::from_secs(1)))
            .endpoint_cost("/api/v1/documents", 5)
            .build();
        assert_eq!(config.ip.requests_per_window, 10);
        assert_eq!(config.endpoint_cost("/api/v1/documents"), Some(5));
        assert_eq!(config.endpoint_cost("/api/v1/other"), None);
    }
}
