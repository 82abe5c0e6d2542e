use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`CircuitBreaker::call`](crate::CircuitBreaker::call).
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was not attempted.
    #[error("circuit is open; call not permitted")]
    Open,

    /// The operation exceeded the configured operation timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// An error returned by the wrapped operation.
    #[error("operation error: {0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Returns true if the error indicates the circuit is open.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open)
    }

    /// Returns true if the error is an operation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CircuitBreakerError::Timeout(_))
    }

    /// Returns the inner operation error if present.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}
