//! Metrics snapshot and rule probes.
//!
//! Alert rules do not reach into the snapshot by reflection; each rule
//! carries a closure projecting the one value it needs. The dotted-path
//! names below exist as a registration convenience and for operator
//! familiarity with the monitoring endpoints.

use std::collections::HashMap;
use std::sync::Arc;

/// Memory-side view from INFO plus derived ratios.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySummary {
    pub used_memory: u64,
    pub used_memory_rss: u64,
    pub maxmemory: u64,
    pub fragmentation_ratio: f64,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    /// used_memory as a percentage of maxmemory; 0 when unbounded.
    pub percentage: f64,
    /// keyspace hits over hits+misses.
    pub hit_rate: f64,
}

/// Connection-side view: server clients plus our pool usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSummary {
    pub connected_clients: u64,
    pub pool_in_use: u64,
    pub pool_capacity: u64,
    /// pool_in_use over pool_capacity.
    pub connection_utilization: f64,
}

/// Latency percentiles for one command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandPercentiles {
    pub count: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Command-side view over the bounded trace history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSummary {
    pub total: u64,
    pub errors: u64,
    /// Error fraction over the last five minutes of traces.
    pub error_rate_5m: f64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
    pub per_command: HashMap<String, CommandPercentiles>,
}

/// Endpoint-health view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSummary {
    /// 1 when the latest sampling pass could not reach the store.
    pub unhealthy_checks: u32,
}

/// Point-in-time view the alert rules evaluate against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub memory: MemorySummary,
    pub connections: ConnectionSummary,
    pub commands: CommandSummary,
    pub health: HealthSummary,
}

/// Projects one value out of a snapshot for an alert rule.
pub type MetricProbe = Arc<dyn Fn(&MetricsSnapshot) -> Option<f64> + Send + Sync>;

/// The probe for a well-known dotted metric path, if one exists.
pub fn standard_probe(path: &str) -> Option<MetricProbe> {
    let probe: MetricProbe = match path {
        "memory.percentage" => Arc::new(|s| Some(s.memory.percentage)),
        "memory.hit_rate" => Arc::new(|s| Some(s.memory.hit_rate)),
        "memory.fragmentation_ratio" => Arc::new(|s| Some(s.memory.fragmentation_ratio)),
        "commands.p95_duration_ms" => Arc::new(|s| Some(s.commands.p95_duration_ms)),
        "commands.p99_duration_ms" => Arc::new(|s| Some(s.commands.p99_duration_ms)),
        "connections.connection_utilization" => {
            Arc::new(|s| Some(s.connections.connection_utilization))
        }
        "performance.error_rate_5m" => Arc::new(|s| Some(s.commands.error_rate_5m)),
        "health.unhealthy_checks" => Arc::new(|s| Some(s.health.unhealthy_checks as f64)),
        _ => return None,
    };
    Some(probe)
}
