use redgate_connection::ConnectionError;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by the cache, session and progress stores.
///
/// A missing key is not an error for read semantics; reads return
/// `Option`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// TTLs must be positive at creation.
    #[error("ttl must be positive")]
    InvalidTtl,

    /// Progress trackers need at least one step.
    #[error("total_steps must be > 0")]
    InvalidTotalSteps,

    /// Step updates must stay within 0..=total_steps.
    #[error("step {step} out of range 0..={total}")]
    StepOutOfRange { step: u32, total: u32 },

    /// Completed and failed trackers are terminal.
    #[error("progress {0} is already finished")]
    ProgressFinished(Uuid),

    /// Mutation of a tracker that does not exist (or already evicted).
    #[error("progress {0} not found")]
    ProgressNotFound(Uuid),

    #[error("malformed cached payload: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Decode(e.to_string())
    }
}
