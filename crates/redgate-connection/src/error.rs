use redgate_circuitbreaker::CircuitBreakerError;
use redgate_core::InvalidTenant;
use thiserror::Error;

/// Low-level store errors produced by a [`RawCommands`](crate::RawCommands)
/// backend, classified so the layers above can tell transient trouble from
/// fatal misconfiguration.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// The connection could not be established or was dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected our credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server did not answer within the socket timeout.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// EVALSHA referenced a script the server does not have.
    #[error("script not loaded: {0}")]
    ScriptMissing(String),

    /// Any other server-side error.
    #[error("store error: {0}")]
    Other(String),
}

impl From<redis::RedisError> for CommandError {
    fn from(e: redis::RedisError) -> Self {
        if e.kind() == redis::ErrorKind::AuthenticationFailed {
            CommandError::Auth(e.to_string())
        } else if e.kind() == redis::ErrorKind::NoScriptError {
            CommandError::ScriptMissing(e.to_string())
        } else if e.is_timeout() {
            CommandError::Timeout(e.to_string())
        } else if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            CommandError::Connection(e.to_string())
        } else {
            CommandError::Other(e.to_string())
        }
    }
}

/// Errors surfaced by the connection factory and isolated connections.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The Redis endpoint is unreachable.
    #[error("redis connection failed: {0}")]
    Connection(String),

    /// Authentication failed; not retryable.
    #[error("redis authentication failed: {0}")]
    Auth(String),

    /// An operation exceeded its timeout.
    #[error("redis operation timed out: {0}")]
    Timeout(String),

    /// No pool slot became available within the connect timeout.
    #[error("connection pool exhausted: {pool}")]
    PoolExhausted { pool: String },

    /// The circuit breaker is open; the call was not attempted.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// An operation would have violated tenant isolation. Programmer
    /// error; never retried.
    #[error("tenant isolation violation for {tenant}: {reason}")]
    IsolationViolation { tenant: String, reason: String },

    /// A server-side script is missing even after reloading.
    #[error("script missing: {0}")]
    ScriptMissing(String),

    /// Any other store error.
    #[error("store error: {0}")]
    Store(String),
}

impl ConnectionError {
    /// Whether this error counts against the circuit breaker.
    ///
    /// Connection failures, timeouts and auth failures do; pool
    /// exhaustion and isolation violations do not.
    pub fn is_breaker_classified(&self) -> bool {
        matches!(
            self,
            ConnectionError::Connection(_) | ConnectionError::Auth(_) | ConnectionError::Timeout(_)
        )
    }

    /// Whether this error means the store is unavailable (the condition
    /// under which the rate limiter fails open).
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ConnectionError::Connection(_)
                | ConnectionError::Timeout(_)
                | ConnectionError::CircuitOpen
        )
    }
}

impl From<CommandError> for ConnectionError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Connection(msg) => ConnectionError::Connection(msg),
            CommandError::Auth(msg) => ConnectionError::Auth(msg),
            CommandError::Timeout(msg) => ConnectionError::Timeout(msg),
            CommandError::ScriptMissing(msg) => ConnectionError::ScriptMissing(msg),
            CommandError::Other(msg) => ConnectionError::Store(msg),
        }
    }
}

impl From<InvalidTenant> for ConnectionError {
    fn from(e: InvalidTenant) -> Self {
        ConnectionError::IsolationViolation {
            tenant: e.0.clone(),
            reason: e.to_string(),
        }
    }
}

impl From<CircuitBreakerError<ConnectionError>> for ConnectionError {
    fn from(e: CircuitBreakerError<ConnectionError>) -> Self {
        match e {
            CircuitBreakerError::Open => ConnectionError::CircuitOpen,
            CircuitBreakerError::Timeout(d) => {
                ConnectionError::Timeout(format!("exceeded operation timeout of {d:?}"))
            }
            CircuitBreakerError::Inner(inner) => inner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_covers_breaker_relevant_kinds() {
        assert!(ConnectionError::Connection("x".into()).is_breaker_classified());
        assert!(ConnectionError::Timeout("x".into()).is_breaker_classified());
        assert!(ConnectionError::Auth("x".into()).is_breaker_classified());
        assert!(!ConnectionError::PoolExhausted { pool: "admin".into() }.is_breaker_classified());
        assert!(!ConnectionError::IsolationViolation {
            tenant: "t".into(),
            reason: "r".into()
        }
        .is_breaker_classified());
    }

    #[test]
    fn fail_open_covers_unavailability_only() {
        assert!(ConnectionError::CircuitOpen.is_unavailable());
        assert!(ConnectionError::Connection("x".into()).is_unavailable());
        assert!(!ConnectionError::Auth("x".into()).is_unavailable());
        assert!(!ConnectionError::Store("x".into()).is_unavailable());
    }

    #[test]
    fn breaker_error_flattens() {
        let e: ConnectionError = CircuitBreakerError::<ConnectionError>::Open.into();
        assert!(matches!(e, ConnectionError::CircuitOpen));

        let e: ConnectionError =
            CircuitBreakerError::Inner(ConnectionError::Store("x".into())).into();
        assert!(matches!(e, ConnectionError::Store(_)));
    }
}
