use redgate_connection::ConnectionConfig;
use redgate_queue::QueueConfig;
use redgate_ratelimiter::RateLimiterConfig;
use std::time::Duration;

/// Retry and breaker knobs passed through to agent-side task handlers.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub breaker_threshold: u32,
    pub breaker_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            breaker_threshold: 5,
            breaker_timeout: Duration::from_secs(60),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl AgentSettings {
    /// Reads `AGENT_MAX_RETRIES`, `AGENT_RETRY_DELAY_SECONDS`,
    /// `AGENT_CIRCUIT_BREAKER_THRESHOLD` and
    /// `AGENT_CIRCUIT_BREAKER_TIMEOUT_SECONDS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_u64("AGENT_MAX_RETRIES", defaults.max_retries as u64) as u32,
            retry_delay: Duration::from_secs(env_u64(
                "AGENT_RETRY_DELAY_SECONDS",
                defaults.retry_delay.as_secs(),
            )),
            breaker_threshold: env_u64(
                "AGENT_CIRCUIT_BREAKER_THRESHOLD",
                defaults.breaker_threshold as u64,
            ) as u32,
            breaker_timeout: Duration::from_secs(env_u64(
                "AGENT_CIRCUIT_BREAKER_TIMEOUT_SECONDS",
                defaults.breaker_timeout.as_secs(),
            )),
        }
    }
}

/// Top-level substrate configuration.
#[derive(Debug, Clone)]
pub struct SubstrateConfig {
    pub connection: ConnectionConfig,
    pub queue: QueueConfig,
    pub rate_limits: RateLimiterConfig,
    pub agent: AgentSettings,
    /// Health sampling cadence.
    pub sampling_interval: Duration,
    /// Alert evaluation cadence.
    pub alert_interval: Duration,
    /// Dead-letter auto-retry scan cadence.
    pub dlq_scan_interval: Duration,
    /// Expired-record cleanup cadence.
    pub cleanup_interval: Duration,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            queue: QueueConfig::default(),
            rate_limits: RateLimiterConfig::default(),
            agent: AgentSettings::default(),
            sampling_interval: Duration::from_secs(30),
            alert_interval: Duration::from_secs(60),
            dlq_scan_interval: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl SubstrateConfig {
    /// Reads the full configuration from the environment, falling back
    /// to defaults for anything unset. The health sampling cadence
    /// follows `REDIS_HEALTH_CHECK_INTERVAL`.
    pub fn from_env() -> Self {
        let connection = ConnectionConfig::from_env();
        Self {
            sampling_interval: connection.health_check_interval,
            connection,
            agent: AgentSettings::from_env(),
            ..Self::default()
        }
    }
}
