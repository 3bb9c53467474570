use thiserror::Error;

use crate::store::StoreError;
use crate::task::TaskStatus;

/// Errors returned by [`crate::SegmentationService`] operations.
///
/// Pipeline failures never surface here; they are recorded on the task
/// itself and observed through its status.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Caller-supplied input was rejected before any state changed.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The task is already queued or running.
    #[error("task {0} is already in progress")]
    Conflict(String),

    /// The result was requested before the task finished.
    #[error("task {id} is {status}, not completed")]
    NotCompleted { id: String, status: TaskStatus },

    /// The submission queue is at capacity; retry later.
    #[error("submission queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The worker pool is shutting down and accepts no new work.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => ServiceError::NotFound(format!("task {id}")),
            StoreError::Transition(crate::task::TransitionError::Busy { id }) => {
                ServiceError::Conflict(id)
            }
            other => ServiceError::Store(other),
        }
    }
}
