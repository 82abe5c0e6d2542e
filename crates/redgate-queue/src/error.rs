use crate::task::TaskError;
use redgate_connection::ConnectionError;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by queue operations.
///
/// "Queue full" and "project queue full" are not errors; they come back
/// as [`EnqueueOutcome`](crate::EnqueueOutcome) values.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("malformed queue data: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Decode(e.to_string())
    }
}
