//! Health sampling and alerting for the redgate substrate.
//!
//! Two cooperating pieces:
//!
//! - [`MetricsSampler`]: a periodic pass collecting memory, connection
//!   and keyspace statistics over the admin connection, plus a
//!   continuous command-latency trace fed by the connection factory's
//!   observer hook. Bounded histories back p50/p95/p99 summaries.
//! - [`AlertManager`]: evaluates threshold rules against snapshots,
//!   keeping at most one active alert per (rule, tenant), with
//!   cooldowns, suppression windows and severity-filtered notification
//!   channels.
//!
//! Endpoint-wide alerts carry the system tenant
//! (`redgate_core::TenantId::SYSTEM`); the orchestrator wires the two
//! loops together.

pub use alerts::{
    Alert, AlertChannel, AlertManager, AlertRule, AlertSeverity, AlertStatus, Comparison,
    SeverityChannel,
};
pub use sampler::MetricsSampler;
pub use snapshot::{
    standard_probe, CommandPercentiles, CommandSummary, ConnectionSummary, HealthSummary,
    MemorySummary, MetricProbe, MetricsSnapshot,
};

mod alerts;
mod sampler;
mod snapshot;
