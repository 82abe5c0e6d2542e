//! Threshold alerting.
//!
//! An evaluation pass compares each enabled rule's probed value against
//! its threshold. At most one Active alert exists per (rule, tenant);
//! triggers while one is active update it in place, and a pass that no
//! longer triggers resolves it. Rules respect a cooldown between
//! evaluations and can be suppressed for a window, during which their
//! active alerts resolve as Suppressed.

use crate::sampler::MetricsSampler;
use crate::snapshot::{MetricProbe, MetricsSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redgate_core::TenantId;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

/// Alert severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Alert lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

/// How a rule's value relates to its threshold to trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl Comparison {
    pub fn triggers(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Lt => value < threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Le => value <= threshold,
            Comparison::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

/// One alerting rule.
#[derive(Clone)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub severity: AlertSeverity,
    pub threshold: f64,
    pub comparison: Comparison,
    pub probe: MetricProbe,
    pub enabled: bool,
    /// Minimum interval between consecutive triggers of this rule.
    pub cooldown: Duration,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        severity: AlertSeverity,
        comparison: Comparison,
        threshold: f64,
        probe: MetricProbe,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            severity,
            threshold,
            comparison,
            probe,
            enabled: true,
            cooldown: Duration::from_secs(300),
        }
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// A raised alert.
#[derive(Debug, Clone)]
pub struct Alert {
    pub alert_id: Uuid,
    pub rule_id: String,
    pub tenant: TenantId,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub current_value: f64,
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
}

/// Delivery target for raised alerts.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this channel wants alerts of the given severity.
    fn accepts(&self, severity: AlertSeverity) -> bool {
        let _ = severity;
        true
    }

    async fn notify(&self, alert: &Alert);
}

/// A channel filtering on a minimum severity and delivering through a
/// closure.
pub struct SeverityChannel<F> {
    name: String,
    min_severity: AlertSeverity,
    deliver: F,
}

impl<F> SeverityChannel<F>
where
    F: Fn(&Alert) + Send + Sync,
{
    pub fn new(name: impl Into<String>, min_severity: AlertSeverity, deliver: F) -> Self {
        Self {
            name: name.into(),
            min_severity,
            deliver,
        }
    }
}

#[async_trait]
impl<F> AlertChannel for SeverityChannel<F>
where
    F: Fn(&Alert) + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, severity: AlertSeverity) -> bool {
        severity >= self.min_severity
    }

    async fn notify(&self, alert: &Alert) {
        (self.deliver)(alert)
    }
}

#[derive(Default)]
struct AlertState {
    active: HashMap<(String, TenantId), Alert>,
    history: VecDeque<Alert>,
    last_fired: HashMap<String, Instant>,
    suppressed_until: HashMap<String, DateTime<Utc>>,
}

const HISTORY_SIZE: usize = 1000;

/// Evaluates rules against snapshots and manages alert lifecycles.
pub struct AlertManager {
    rules: Vec<AlertRule>,
    channels: Vec<Arc<dyn AlertChannel>>,
    state: Mutex<AlertState>,
    interval: Duration,
}

impl AlertManager {
    /// Default evaluation interval.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(rules: Vec<AlertRule>, channels: Vec<Arc<dyn AlertChannel>>) -> Self {
        Self {
            rules,
            channels,
            state: Mutex::new(AlertState::default()),
            interval: Self::DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The built-in rule set over the standard snapshot metrics.
    pub fn default_rules() -> Vec<AlertRule> {
        use crate::snapshot::standard_probe;
        let probe = |path: &str| standard_probe(path).expect("known metric path");

        vec![
            AlertRule::new(
                "memory_high",
                "Memory usage high",
                AlertSeverity::Warning,
                Comparison::Ge,
                80.0,
                probe("memory.percentage"),
            ),
            AlertRule::new(
                "memory_critical",
                "Memory usage critical",
                AlertSeverity::Critical,
                Comparison::Ge,
                90.0,
                probe("memory.percentage"),
            )
            .cooldown(Duration::from_secs(120)),
            AlertRule::new(
                "hit_rate_low",
                "Keyspace hit rate low",
                AlertSeverity::Warning,
                Comparison::Lt,
                0.8,
                probe("memory.hit_rate"),
            )
            .cooldown(Duration::from_secs(600)),
            AlertRule::new(
                "command_latency_p95",
                "Command p95 latency high",
                AlertSeverity::Error,
                Comparison::Gt,
                100.0,
                probe("commands.p95_duration_ms"),
            ),
            AlertRule::new(
                "connection_utilization_high",
                "Connection pool utilization high",
                AlertSeverity::Warning,
                Comparison::Gt,
                0.8,
                probe("connections.connection_utilization"),
            ),
            AlertRule::new(
                "connection_utilization_critical",
                "Connection pool utilization critical",
                AlertSeverity::Critical,
                Comparison::Gt,
                0.95,
                probe("connections.connection_utilization"),
            )
            .cooldown(Duration::from_secs(120)),
            AlertRule::new(
                "error_rate_high",
                "Command error rate high",
                AlertSeverity::Error,
                Comparison::Gt,
                0.05,
                probe("performance.error_rate_5m"),
            ),
            AlertRule::new(
                "health_check_failed",
                "Endpoint health check failing",
                AlertSeverity::Critical,
                Comparison::Eq,
                1.0,
                probe("health.unhealthy_checks"),
            )
            .cooldown(Duration::from_secs(60)),
        ]
    }

    /// Evaluates every rule against a snapshot on behalf of `tenant`.
    pub async fn evaluate(&self, snapshot: &MetricsSnapshot, tenant: &TenantId) {
        let now = Utc::now();

        for rule in &self.rules {
            if !rule.enabled {
                continue;
            }

            {
                let state = self.state.lock().await;
                if let Some(until) = state.suppressed_until.get(&rule.id) {
                    if *until > now {
                        continue;
                    }
                }
            }

            let Some(value) = (rule.probe)(snapshot) else {
                tracing::debug!(rule = %rule.id, "metric probe produced no value");
                continue;
            };

            if rule.comparison.triggers(value, rule.threshold) {
                self.trigger(rule, tenant, value, now).await;
            } else {
                self.resolve_rule(&rule.id, tenant, now).await;
            }
        }
    }

    async fn trigger(&self, rule: &AlertRule, tenant: &TenantId, value: f64, now: DateTime<Utc>) {
        let notify: Option<Alert> = {
            let mut state = self.state.lock().await;
            let key = (rule.id.clone(), *tenant);

            if let Some(existing) = state.active.get_mut(&key) {
                existing.current_value = value;
                existing.updated_at = now;
                None
            } else {
                // Cooldown bounds how often a rule can raise a fresh alert.
                if let Some(fired) = state.last_fired.get(&rule.id) {
                    if fired.elapsed() < rule.cooldown {
                        return;
                    }
                }
                let alert = Alert {
                    alert_id: Uuid::new_v4(),
                    rule_id: rule.id.clone(),
                    tenant: *tenant,
                    severity: rule.severity,
                    status: AlertStatus::Active,
                    message: format!(
                        "{}: value {value:.3} breaches threshold {:.3}",
                        rule.name, rule.threshold
                    ),
                    current_value: value,
                    threshold: rule.threshold,
                    created_at: now,
                    updated_at: now,
                    resolved_at: None,
                    acknowledged_by: None,
                };
                state.last_fired.insert(rule.id.clone(), Instant::now());
                state.active.insert(key, alert.clone());
                Some(alert)
            }
        };

        if let Some(alert) = notify {
            tracing::warn!(
                rule = %alert.rule_id,
                tenant = %alert.tenant,
                severity = alert.severity.as_str(),
                value = alert.current_value,
                threshold = alert.threshold,
                "alert raised"
            );

            #[cfg(feature = "metrics")]
            metrics::counter!(
                "redgate_alerts_raised_total",
                "rule" => alert.rule_id.clone(),
                "severity" => alert.severity.as_str()
            )
            .increment(1);

            for channel in &self.channels {
                if channel.accepts(alert.severity) {
                    channel.notify(&alert).await;
                }
            }
        }
    }

    async fn resolve_rule(&self, rule_id: &str, tenant: &TenantId, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        let key = (rule_id.to_string(), *tenant);
        if let Some(mut alert) = state.active.remove(&key) {
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(now);
            alert.updated_at = now;
            tracing::info!(rule = %rule_id, tenant = %tenant, "alert resolved");
            push_history(&mut state.history, alert);
        }
    }

    /// Acknowledges an active alert. Returns false when unknown or not
    /// active.
    pub async fn acknowledge(&self, alert_id: &Uuid, by: &str) -> bool {
        let mut state = self.state.lock().await;
        for alert in state.active.values_mut() {
            if alert.alert_id == *alert_id && alert.status == AlertStatus::Active {
                alert.status = AlertStatus::Acknowledged;
                alert.acknowledged_by = Some(by.to_string());
                alert.updated_at = Utc::now();
                return true;
            }
        }
        false
    }

    /// Manually resolves an alert (active or acknowledged).
    pub async fn resolve(&self, alert_id: &Uuid) -> bool {
        let mut state = self.state.lock().await;
        let key = state
            .active
            .iter()
            .find(|(_, alert)| alert.alert_id == *alert_id)
            .map(|(key, _)| key.clone());
        if let Some(key) = key {
            let mut alert = state.active.remove(&key).expect("key just found");
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(Utc::now());
            alert.updated_at = Utc::now();
            push_history(&mut state.history, alert);
            true
        } else {
            false
        }
    }

    /// Suppresses a rule for the given number of hours; its active
    /// alerts resolve as Suppressed.
    pub async fn suppress(&self, rule_id: &str, hours: u32) {
        let until = Utc::now() + ChronoDuration::hours(hours as i64);
        let mut state = self.state.lock().await;
        state.suppressed_until.insert(rule_id.to_string(), until);

        let keys: Vec<(String, TenantId)> = state
            .active
            .keys()
            .filter(|(rule, _)| rule == rule_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(mut alert) = state.active.remove(&key) {
                alert.status = AlertStatus::Suppressed;
                alert.resolved_at = Some(Utc::now());
                alert.updated_at = Utc::now();
                push_history(&mut state.history, alert);
            }
        }
        tracing::info!(rule = rule_id, hours, "rule suppressed");
    }

    /// Currently active (or acknowledged) alerts.
    pub async fn active_alerts(&self) -> Vec<Alert> {
        let state = self.state.lock().await;
        let mut alerts: Vec<Alert> = state.active.values().cloned().collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    /// Recently finished alerts, newest first.
    pub async fn history(&self) -> Vec<Alert> {
        let state = self.state.lock().await;
        state.history.iter().rev().cloned().collect()
    }

    /// Runs the evaluation loop over the sampler's snapshots until the
    /// shutdown signal flips. Endpoint-level alerts carry the system
    /// tenant.
    pub async fn run(
        self: Arc<Self>,
        sampler: Arc<MetricsSampler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = sampler.snapshot();
                    self.evaluate(&snapshot, &TenantId::SYSTEM).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("alert evaluation loop stopped");
    }
}

fn push_history(history: &mut VecDeque<Alert>, alert: Alert) {
    if history.len() >= HISTORY_SIZE {
        history.pop_front();
    }
    history.push_back(alert);
}
