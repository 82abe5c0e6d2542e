use redgate_cache::CacheError;
use redgate_connection::ConnectionError;
use redgate_queue::QueueError;
use redgate_ratelimiter::RateLimitError;
use thiserror::Error;

/// Top-level errors from substrate startup and facade operations.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("configuration error: {0}")]
    Config(String),
}
