use crate::config::CircuitBreakerConfig;
use crate::events::CircuitBreakerEvent;
#[cfg(feature = "metrics")]
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Represents the state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    /// The circuit is closed and calls are allowed.
    Closed = 0,
    /// The circuit is open and calls are rejected.
    Open = 1,
    /// The circuit is half-open and calls are allowed while recovery is
    /// being probed.
    HalfOpen = 2,
}

impl CircuitState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of the circuit breaker for monitoring endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerStatus {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive-failure counter driving the open transition.
    pub failure_count: u32,
    /// Success counter while half-open.
    pub success_count: u32,
    /// Total calls attempted through the breaker.
    pub total_calls: u64,
    /// Calls that completed successfully.
    pub successful_calls: u64,
    /// Calls that failed with a classified failure.
    pub failed_calls: u64,
    /// Calls that failed by exceeding the operation timeout.
    pub timeout_calls: u64,
    /// Number of times the circuit has opened.
    pub circuit_opens: u64,
    /// Fraction of calls that succeeded.
    pub success_rate: f64,
    /// Fraction of calls that failed.
    pub failure_rate: f64,
    /// Time since the last state transition.
    pub time_since_state_change: std::time::Duration,
}

pub(crate) struct Circuit {
    state: CircuitState,
    state_atomic: Arc<AtomicU8>,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    timeout_calls: u64,
    circuit_opens: u64,
}

impl Circuit {
    pub(crate) fn new_with_atomic(state_atomic: Arc<AtomicU8>) -> Self {
        Self {
            state: CircuitState::Closed,
            state_atomic,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_state_change: Instant::now(),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            timeout_calls: 0,
            circuit_opens: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self::new_with_atomic(Arc::new(AtomicU8::new(CircuitState::Closed as u8)))
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) fn status(&self) -> BreakerStatus {
        let success_rate = if self.total_calls > 0 {
            self.successful_calls as f64 / self.total_calls as f64
        } else {
            0.0
        };
        let failure_rate = if self.total_calls > 0 {
            self.failed_calls as f64 / self.total_calls as f64
        } else {
            0.0
        };

        BreakerStatus {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.failed_calls,
            timeout_calls: self.timeout_calls,
            circuit_opens: self.circuit_opens,
            success_rate,
            failure_rate,
            time_since_state_change: self.last_state_change.elapsed(),
        }
    }

    /// Decides whether a call may proceed, transitioning Open -> HalfOpen
    /// once the recovery timeout has elapsed since the last failure.
    pub(crate) fn try_acquire(&mut self, config: &CircuitBreakerConfig) -> bool {
        self.total_calls += 1;

        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                config
                    .event_listeners
                    .emit(&CircuitBreakerEvent::CallPermitted {
                        breaker_name: config.name.clone(),
                        state: self.state,
                    });
                true
            }
            CircuitState::Open => {
                let recovered = match self.last_failure_time {
                    Some(at) => at.elapsed() >= config.recovery_timeout,
                    None => true,
                };
                if recovered {
                    self.transition_to(CircuitState::HalfOpen, config);
                    config
                        .event_listeners
                        .emit(&CircuitBreakerEvent::CallPermitted {
                            breaker_name: config.name.clone(),
                            state: self.state,
                        });
                    true
                } else {
                    config
                        .event_listeners
                        .emit(&CircuitBreakerEvent::CallRejected {
                            breaker_name: config.name.clone(),
                        });
                    false
                }
            }
        }
    }

    pub(crate) fn record_success(&mut self, config: &CircuitBreakerConfig) {
        self.successful_calls += 1;

        config
            .event_listeners
            .emit(&CircuitBreakerEvent::SuccessRecorded {
                breaker_name: config.name.clone(),
                state: self.state,
            });

        #[cfg(feature = "metrics")]
        counter!("redgate_breaker_calls_total", "breaker" => config.name.clone(), "outcome" => "success")
            .increment(1);

        match self.state {
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= config.success_threshold {
                    self.transition_to(CircuitState::Closed, config);
                }
            }
            CircuitState::Closed => {
                // Successes decay the failure counter toward zero.
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    pub(crate) fn record_failure(&mut self, config: &CircuitBreakerConfig, timed_out: bool) {
        self.failed_calls += 1;
        if timed_out {
            self.timeout_calls += 1;
        }
        self.last_failure_time = Some(Instant::now());

        config
            .event_listeners
            .emit(&CircuitBreakerEvent::FailureRecorded {
                breaker_name: config.name.clone(),
                state: self.state,
            });

        #[cfg(feature = "metrics")]
        counter!("redgate_breaker_calls_total", "breaker" => config.name.clone(), "outcome" => "failure")
            .increment(1);

        match self.state {
            CircuitState::HalfOpen => {
                // A single failure while probing reopens the circuit.
                self.success_count = 0;
                self.transition_to(CircuitState::Open, config);
            }
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= config.failure_threshold {
                    self.transition_to(CircuitState::Open, config);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub(crate) fn reset(&mut self, config: &CircuitBreakerConfig) {
        self.transition_to(CircuitState::Closed, config);
        self.last_failure_time = None;
    }

    fn transition_to(&mut self, state: CircuitState, config: &CircuitBreakerConfig) {
        if self.state == state {
            return;
        }

        let from_state = self.state;

        config
            .event_listeners
            .emit(&CircuitBreakerEvent::StateTransition {
                breaker_name: config.name.clone(),
                from_state,
                to_state: state,
            });

        tracing::info!(
            breaker = %config.name,
            from = from_state.as_str(),
            to = state.as_str(),
            failure_count = self.failure_count,
            "circuit state transition"
        );

        if state == CircuitState::Open {
            self.circuit_opens += 1;
        }

        #[cfg(feature = "metrics")]
        {
            counter!(
                "redgate_breaker_transitions_total",
                "breaker" => config.name.clone(),
                "from" => from_state.as_str(),
                "to" => state.as_str()
            )
            .increment(1);

            gauge!("redgate_breaker_state", "breaker" => config.name.clone())
                .set(state as u8 as f64);
        }

        self.state = state;
        self.state_atomic.store(state as u8, Ordering::Release);
        self.last_state_change = Instant::now();
        if state == CircuitState::Closed {
            self.failure_count = 0;
            self.success_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder::<()>()
            .failure_threshold(3)
            .success_threshold(2)
            .recovery_timeout(Duration::from_millis(50))
            .name("test")
            .build_config()
    }

    #[test]
    fn opens_after_failure_threshold() {
        let config = config();
        let mut circuit = Circuit::new();

        circuit.record_failure(&config, false);
        circuit.record_failure(&config, false);
        assert_eq!(circuit.state(), CircuitState::Closed);

        circuit.record_failure(&config, false);
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.status().circuit_opens, 1);
    }

    #[test]
    fn success_decays_failure_count() {
        let config = config();
        let mut circuit = Circuit::new();

        circuit.record_failure(&config, false);
        circuit.record_failure(&config, false);
        circuit.record_success(&config);
        // Two failures, one decayed: one more failure is not enough to open.
        circuit.record_failure(&config, false);
        assert_eq!(circuit.state(), CircuitState::Closed);

        circuit.record_failure(&config, false);
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_until_recovery_timeout() {
        let config = config();
        let mut circuit = Circuit::new();

        for _ in 0..3 {
            circuit.record_failure(&config, false);
        }
        assert!(!circuit.try_acquire(&config));

        std::thread::sleep(Duration::from_millis(60));
        assert!(circuit.try_acquire(&config));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let config = config();
        let mut circuit = Circuit::new();

        for _ in 0..3 {
            circuit.record_failure(&config, false);
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(circuit.try_acquire(&config));

        circuit.record_success(&config);
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        circuit.record_success(&config);
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.status().failure_count, 0);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let config = config();
        let mut circuit = Circuit::new();

        for _ in 0..3 {
            circuit.record_failure(&config, false);
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(circuit.try_acquire(&config));
        circuit.record_success(&config);

        circuit.record_failure(&config, false);
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.status().success_count, 0);
    }

    #[test]
    fn status_reports_rates() {
        let config = config();
        let mut circuit = Circuit::new();

        assert!(circuit.try_acquire(&config));
        circuit.record_success(&config);
        assert!(circuit.try_acquire(&config));
        circuit.record_failure(&config, true);

        let status = circuit.status();
        assert_eq!(status.total_calls, 2);
        assert_eq!(status.successful_calls, 1);
        assert_eq!(status.failed_calls, 1);
        assert_eq!(status.timeout_calls, 1);
        assert!((status.success_rate - 0.5).abs() < f64::EPSILON);
    }
}
