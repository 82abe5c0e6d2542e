use redgate_connection::ConnectionError;
use redgate_core::KeyError;
use thiserror::Error;

/// Errors returned by the rate limiter.
///
/// Denials are not errors; they come back as decisions with
/// `allowed = false`. These variants cover programmer errors and the
/// store-side failures that the fail-open path does not swallow.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// `cost` must be at least 1; rejected before any I/O.
    #[error("rate limit cost must be >= 1, got {0}")]
    InvalidCost(u32),

    /// The identifier had an invalid shape.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// A store failure that is not covered by the fail-open policy.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The atomic script returned an unexpected reply shape.
    #[error("malformed rate limit script reply: {0}")]
    Decode(String),
}
