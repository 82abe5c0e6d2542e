use std::time::Duration;

/// Connection factory configuration.
///
/// Defaults match the documented environment variables; `from_env` reads
/// them with these values as fallbacks.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Redis endpoint URL.
    pub url: String,
    /// Global connection budget; tenant pools get a quarter of it.
    pub max_connections: usize,
    /// Time allowed to establish a connection or acquire a pool slot.
    pub connect_timeout: Duration,
    /// Timeout applied to every operation through the breaker.
    pub operation_timeout: Duration,
    /// Interval between factory-level health probes.
    pub health_check_interval: Duration,
    /// Classified failures before the breaker opens.
    pub breaker_failure_threshold: u32,
    /// How long the breaker stays open before probing recovery.
    pub breaker_recovery_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_connections: 20,
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            breaker_failure_threshold: 5,
            breaker_recovery_timeout: Duration::from_secs(60),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ConnectionConfig {
    /// Reads configuration from the environment, falling back to defaults.
    ///
    /// Variables: `REDIS_URL`, `REDIS_MAX_CONNECTIONS`,
    /// `REDIS_CONNECTION_TIMEOUT`, `REDIS_OPERATION_TIMEOUT`,
    /// `REDIS_HEALTH_CHECK_INTERVAL`, `CIRCUIT_BREAKER_FAILURE_THRESHOLD`,
    /// `CIRCUIT_BREAKER_RECOVERY_TIMEOUT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("REDIS_URL").unwrap_or(defaults.url),
            max_connections: env_u64("REDIS_MAX_CONNECTIONS", defaults.max_connections as u64)
                as usize,
            connect_timeout: Duration::from_secs(env_u64(
                "REDIS_CONNECTION_TIMEOUT",
                defaults.connect_timeout.as_secs(),
            )),
            operation_timeout: Duration::from_secs(env_u64(
                "REDIS_OPERATION_TIMEOUT",
                defaults.operation_timeout.as_secs(),
            )),
            health_check_interval: Duration::from_secs(env_u64(
                "REDIS_HEALTH_CHECK_INTERVAL",
                defaults.health_check_interval.as_secs(),
            )),
            breaker_failure_threshold: env_u64(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold as u64,
            ) as u32,
            breaker_recovery_timeout: Duration::from_secs(env_u64(
                "CIRCUIT_BREAKER_RECOVERY_TIMEOUT",
                defaults.breaker_recovery_timeout.as_secs(),
            )),
        }
    }

    /// Size of a tenant pool: a quarter of the global budget, floor of 2.
    pub fn tenant_pool_size(&self) -> usize {
        (self.max_connections / 4).max(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_pools_are_a_quarter_with_floor() {
        let mut config = ConnectionConfig::default();
        config.max_connections = 20;
        assert_eq!(config.tenant_pool_size(), 5);

        config.max_connections = 4;
        assert_eq!(config.tenant_pool_size(), 2);

        config.max_connections = 1;
        assert_eq!(config.tenant_pool_size(), 2);
    }
}
