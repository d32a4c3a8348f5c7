//! Error types for deployit.

use thiserror::Error;

use crate::JobId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The caller no longer holds the exclusivity lease for the job.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
