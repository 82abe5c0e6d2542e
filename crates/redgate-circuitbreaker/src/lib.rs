//! Circuit breaker for the redgate substrate.
//!
//! Wraps asynchronous operations against one logical Redis endpoint and
//! opens the circuit when classified failures (connection errors, timeouts,
//! OS-level I/O errors) pile up, so a struggling endpoint fails fast
//! instead of cascading.
//!
//! ## States
//! - **Closed**: normal operation; successes decay the failure counter
//! - **Open**: calls are rejected immediately, without network I/O
//! - **Half-open**: calls are allowed while recovery is probed
//!
//! ## Example
//!
//! ```rust
//! use redgate_circuitbreaker::{CircuitBreaker, CircuitBreakerError};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker: CircuitBreaker<std::io::Error> = CircuitBreaker::builder()
//!     .failure_threshold(5)
//!     .success_threshold(3)
//!     .recovery_timeout(Duration::from_secs(60))
//!     .operation_timeout(Duration::from_secs(10))
//!     .name("redis")
//!     .build();
//!
//! let result = breaker.call(|| async { Ok::<_, std::io::Error>(42) }).await;
//! assert_eq!(result.unwrap(), 42);
//! # }
//! ```
//!
//! ## Failure classification
//!
//! Only classified failures move the circuit; programmer errors propagate
//! untouched:
//!
//! ```rust
//! use redgate_circuitbreaker::CircuitBreaker;
//!
//! let breaker: CircuitBreaker<std::io::Error> = CircuitBreaker::builder()
//!     .failure_classifier(|e: &std::io::Error| {
//!         matches!(
//!             e.kind(),
//!             std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut
//!         )
//!     })
//!     .build();
//! ```

use std::future::Future;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use circuit::{BreakerStatus, CircuitState};
pub use config::{CircuitBreakerBuilder, CircuitBreakerConfig};
pub use error::CircuitBreakerError;
pub use events::CircuitBreakerEvent;

use crate::circuit::Circuit;

mod circuit;
mod config;
mod error;
mod events;

pub(crate) type FailureClassifier<E> = dyn Fn(&E) -> bool + Send + Sync;
pub(crate) type SharedFailureClassifier<E> = Arc<FailureClassifier<E>>;

/// A circuit breaker guarding async operations that fail with `E`.
///
/// One instance is shared per connection factory; state transitions are
/// serialized by a mutex so concurrent callers observe a consistent view.
pub struct CircuitBreaker<E> {
    circuit: Mutex<Circuit>,
    state_atomic: Arc<AtomicU8>,
    config: Arc<CircuitBreakerConfig>,
    classifier: SharedFailureClassifier<E>,
}

impl<E> CircuitBreaker<E> {
    /// Returns a new builder with the default configuration.
    pub fn builder() -> CircuitBreakerBuilder<E> {
        CircuitBreakerBuilder::new()
    }

    pub(crate) fn new(config: CircuitBreakerConfig, classifier: SharedFailureClassifier<E>) -> Self {
        let state_atomic = Arc::new(AtomicU8::new(CircuitState::Closed as u8));
        Self {
            circuit: Mutex::new(Circuit::new_with_atomic(Arc::clone(&state_atomic))),
            state_atomic,
            config: Arc::new(config),
            classifier,
        }
    }

    /// Executes `op` with circuit breaker protection.
    ///
    /// The operation is bounded by the configured operation timeout; a
    /// timeout is always a classified failure. When the circuit is open the
    /// call fails fast with [`CircuitBreakerError::Open`] and `op` is never
    /// invoked.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permitted = {
            let mut circuit = self.circuit.lock().await;
            circuit.try_acquire(&self.config)
        };

        if !permitted {
            tracing::debug!(breaker = %self.config.name, "call rejected; circuit open");
            return Err(CircuitBreakerError::Open);
        }

        match tokio::time::timeout(self.config.operation_timeout, op()).await {
            Ok(Ok(value)) => {
                let mut circuit = self.circuit.lock().await;
                circuit.record_success(&self.config);
                Ok(value)
            }
            Ok(Err(e)) => {
                if (self.classifier)(&e) {
                    let mut circuit = self.circuit.lock().await;
                    circuit.record_failure(&self.config, false);
                } else {
                    tracing::debug!(
                        breaker = %self.config.name,
                        "unclassified error passed through circuit breaker"
                    );
                }
                Err(CircuitBreakerError::Inner(e))
            }
            Err(_) => {
                tracing::warn!(
                    breaker = %self.config.name,
                    timeout = ?self.config.operation_timeout,
                    "operation timed out"
                );
                let mut circuit = self.circuit.lock().await;
                circuit.record_failure(&self.config, true);
                Err(CircuitBreakerError::Timeout(self.config.operation_timeout))
            }
        }
    }

    /// Returns the current state of the circuit.
    pub async fn state(&self) -> CircuitState {
        self.circuit.lock().await.state()
    }

    /// Returns the current state without requiring async context.
    ///
    /// Reads an atomic mirror kept in sync with the actual state; safe to
    /// call from metrics collection or health endpoints.
    pub fn state_sync(&self) -> CircuitState {
        CircuitState::from_u8(self.state_atomic.load(std::sync::atomic::Ordering::Acquire))
    }

    /// Returns a monitoring snapshot of the breaker.
    pub async fn status(&self) -> BreakerStatus {
        self.circuit.lock().await.status()
    }

    /// Manually resets the circuit to closed and clears the counters.
    pub async fn reset(&self) {
        let mut circuit = self.circuit.lock().await;
        circuit.reset(&self.config);
    }
}
