use cv_core::types::JobStatus;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// Another worker won the claim, or the job left `Pending`.
    #[error("job {0} already claimed")]
    AlreadyClaimed(Uuid),

    #[error("job {id} is {status}; cannot {operation}")]
    InvalidState {
        id: Uuid,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store: {0}")]
    Store(#[from] tokio_rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
