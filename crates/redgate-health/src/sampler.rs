//! Periodic health sampling and command tracing.
//!
//! Every 30 seconds (configurable) the sampler collects memory,
//! connection and keyspace statistics over the admin connection and our
//! own pool utilization from the factory, keeping a bounded history for
//! percentile computation. Command traces arrive continuously through
//! the [`CommandObserver`] hook registered with the connection factory.

use crate::snapshot::{
    CommandPercentiles, CommandSummary, ConnectionSummary, HealthSummary, MemorySummary,
    MetricsSnapshot,
};
use redgate_connection::{CommandObserver, CommandRecord, ConnectionError, ConnectionFactory};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Bounded command-trace history size.
const COMMAND_HISTORY_SIZE: usize = 10_000;
/// Memory/connection samples are kept for this long.
const SAMPLE_RETENTION: Duration = Duration::from_secs(3600);
/// Window for the rolling error rate.
const ERROR_RATE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CommandSample {
    command: &'static str,
    duration_ms: f64,
    success: bool,
    at: Instant,
}

#[derive(Debug, Clone)]
struct MemorySample {
    at: Instant,
    summary: MemorySummary,
}

#[derive(Debug, Clone)]
struct ConnectionSample {
    at: Instant,
    summary: ConnectionSummary,
}

#[derive(Default)]
struct Histories {
    commands: Mutex<VecDeque<CommandSample>>,
    memory: Mutex<VecDeque<MemorySample>>,
    connections: Mutex<VecDeque<ConnectionSample>>,
}

/// Parses a Redis INFO payload into field/value pairs.
pub(crate) fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Nearest-rank percentile over an already-sorted slice.
pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

struct TraceSink {
    histories: Arc<Histories>,
}

impl CommandObserver for TraceSink {
    fn record(&self, record: CommandRecord) {
        let mut commands = self
            .histories
            .commands
            .lock()
            .expect("command history lock poisoned");
        if commands.len() >= COMMAND_HISTORY_SIZE {
            commands.pop_front();
        }
        commands.push_back(CommandSample {
            command: record.command,
            duration_ms: record.duration.as_secs_f64() * 1000.0,
            success: record.success,
            at: Instant::now(),
        });

        #[cfg(feature = "metrics")]
        {
            metrics::histogram!(
                "redgate_command_duration_ms",
                "command" => record.command,
                "category" => record.category.as_str()
            )
            .record(record.duration.as_secs_f64() * 1000.0);
            if !record.success {
                metrics::counter!("redgate_command_errors_total", "command" => record.command)
                    .increment(1);
            }
        }
    }
}

/// Collects endpoint statistics and serves [`MetricsSnapshot`]s.
pub struct MetricsSampler {
    factory: Arc<ConnectionFactory>,
    histories: Arc<Histories>,
    interval: Duration,
    unhealthy_checks: AtomicU32,
}

impl MetricsSampler {
    /// Default sampling interval.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

    pub fn new(factory: Arc<ConnectionFactory>, interval: Duration) -> Arc<Self> {
        let sampler = Arc::new(Self {
            factory,
            histories: Arc::new(Histories::default()),
            interval,
            unhealthy_checks: AtomicU32::new(0),
        });
        sampler.factory.set_command_observer(Arc::new(TraceSink {
            histories: Arc::clone(&sampler.histories),
        }));
        sampler
    }

    /// Collects one sample. Failures mark the endpoint unhealthy and are
    /// otherwise left to the caller's loop policy.
    pub async fn sample_once(&self) -> Result<(), ConnectionError> {
        let result = self
            .factory
            .with_admin_connection(|conn| async move {
                let memory = conn.info("memory").await?;
                let clients = conn.info("clients").await?;
                let stats = conn.info("stats").await?;
                Ok((memory, clients, stats))
            })
            .await;

        let (memory_info, clients_info, stats_info) = match result {
            Ok(payloads) => payloads,
            Err(e) => {
                self.unhealthy_checks.store(1, Ordering::Release);
                return Err(e);
            }
        };
        self.unhealthy_checks.store(0, Ordering::Release);

        let memory = parse_info(&memory_info);
        let clients = parse_info(&clients_info);
        let stats = parse_info(&stats_info);
        let get_u64 = |map: &HashMap<String, String>, key: &str| {
            map.get(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0)
        };
        let get_f64 = |map: &HashMap<String, String>, key: &str| {
            map.get(key).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0)
        };

        let used_memory = get_u64(&memory, "used_memory");
        let maxmemory = get_u64(&memory, "maxmemory");
        let keyspace_hits = get_u64(&stats, "keyspace_hits");
        let keyspace_misses = get_u64(&stats, "keyspace_misses");
        let memory_summary = MemorySummary {
            used_memory,
            used_memory_rss: get_u64(&memory, "used_memory_rss"),
            maxmemory,
            fragmentation_ratio: get_f64(&memory, "mem_fragmentation_ratio"),
            keyspace_hits,
            keyspace_misses,
            percentage: if maxmemory > 0 {
                used_memory as f64 / maxmemory as f64 * 100.0
            } else {
                0.0
            },
            hit_rate: if keyspace_hits + keyspace_misses > 0 {
                keyspace_hits as f64 / (keyspace_hits + keyspace_misses) as f64
            } else {
                1.0
            },
        };

        let pools = self.factory.pool_stats().await;
        let pool_in_use: u64 = pools.iter().map(|p| p.in_use as u64).sum();
        let pool_capacity: u64 = pools.iter().map(|p| p.max_size as u64).sum();
        let connection_summary = ConnectionSummary {
            connected_clients: get_u64(&clients, "connected_clients"),
            pool_in_use,
            pool_capacity,
            connection_utilization: if pool_capacity > 0 {
                pool_in_use as f64 / pool_capacity as f64
            } else {
                0.0
            },
        };

        #[cfg(feature = "metrics")]
        {
            metrics::gauge!("redgate_memory_used_bytes").set(memory_summary.used_memory as f64);
            metrics::gauge!("redgate_memory_percentage").set(memory_summary.percentage);
            metrics::gauge!("redgate_keyspace_hit_rate").set(memory_summary.hit_rate);
            metrics::gauge!("redgate_pool_utilization")
                .set(connection_summary.connection_utilization);
            metrics::gauge!("redgate_connected_clients")
                .set(connection_summary.connected_clients as f64);
        }

        let now = Instant::now();
        {
            let mut history = self.histories.memory.lock().expect("memory history lock poisoned");
            history.push_back(MemorySample {
                at: now,
                summary: memory_summary,
            });
            prune(&mut history, |s| s.at, now);
        }
        {
            let mut history = self
                .histories
                .connections
                .lock()
                .expect("connection history lock poisoned");
            history.push_back(ConnectionSample {
                at: now,
                summary: connection_summary,
            });
            prune(&mut history, |s| s.at, now);
        }

        tracing::debug!(
            used_memory,
            pool_in_use,
            pool_capacity,
            "health sample collected"
        );
        Ok(())
    }

    /// The current snapshot, computed from the histories.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let memory = self
            .histories
            .memory
            .lock()
            .expect("memory history lock poisoned")
            .back()
            .map(|s| s.summary.clone())
            // No sample yet: report a healthy hit rate rather than
            // tripping the low-hit-rate rule on boot.
            .unwrap_or(MemorySummary {
                hit_rate: 1.0,
                ..MemorySummary::default()
            });
        let connections = self
            .histories
            .connections
            .lock()
            .expect("connection history lock poisoned")
            .back()
            .map(|s| s.summary.clone())
            .unwrap_or_default();

        let commands = {
            let history = self
                .histories
                .commands
                .lock()
                .expect("command history lock poisoned");
            summarize_commands(&history)
        };

        MetricsSnapshot {
            memory,
            connections,
            commands,
            health: HealthSummary {
                unhealthy_checks: self.unhealthy_checks.load(Ordering::Acquire),
            },
        }
    }

    /// Runs the sampling loop until the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sample_once().await {
                        tracing::warn!(error = %e, "health sampling pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("health sampling loop stopped");
    }
}

fn prune<T>(history: &mut VecDeque<T>, at: impl Fn(&T) -> Instant, now: Instant) {
    while let Some(front) = history.front() {
        if now.duration_since(at(front)) > SAMPLE_RETENTION {
            history.pop_front();
        } else {
            break;
        }
    }
}

fn summarize_commands(history: &VecDeque<CommandSample>) -> CommandSummary {
    if history.is_empty() {
        return CommandSummary::default();
    }

    let now = Instant::now();
    let total = history.len() as u64;
    let errors = history.iter().filter(|s| !s.success).count() as u64;

    let recent: Vec<&CommandSample> = history
        .iter()
        .filter(|s| now.duration_since(s.at) <= ERROR_RATE_WINDOW)
        .collect();
    let error_rate_5m = if recent.is_empty() {
        0.0
    } else {
        recent.iter().filter(|s| !s.success).count() as f64 / recent.len() as f64
    };

    let mut all: Vec<f64> = history.iter().map(|s| s.duration_ms).collect();
    all.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut per_command_durations: HashMap<String, Vec<f64>> = HashMap::new();
    for sample in history {
        per_command_durations
            .entry(sample.command.to_string())
            .or_default()
            .push(sample.duration_ms);
    }
    let per_command = per_command_durations
        .into_iter()
        .map(|(command, mut durations)| {
            durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            (
                command,
                CommandPercentiles {
                    count: durations.len() as u64,
                    p50_ms: percentile(&durations, 0.50),
                    p95_ms: percentile(&durations, 0.95),
                    p99_ms: percentile(&durations, 0.99),
                },
            )
        })
        .collect();

    CommandSummary {
        total,
        errors,
        error_rate_5m,
        p50_duration_ms: percentile(&all, 0.50),
        p95_duration_ms: percentile(&all, 0.95),
        p99_duration_ms: percentile(&all, 0.99),
        per_command,
    }
}
