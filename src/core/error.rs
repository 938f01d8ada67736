//! Error types for scheduler operations.

use thiserror::Error;

use crate::core::job::JobState;
use crate::util::ids::JobId;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Submission was malformed and never entered the queue.
    #[error("invalid job: {0}")]
    InvalidJob(String),
    /// Queue is full.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// No job with this identifier is known.
    #[error("unknown job: {0}")]
    UnknownJob(JobId),
    /// A state transition not allowed by the job state machine was requested.
    #[error("illegal transition for job {job_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Job the transition was attempted on.
        job_id: JobId,
        /// State the job was in.
        from: JobState,
        /// Requested target state.
        to: JobState,
    },
    /// The buffer token for this job was already released.
    #[error("buffers already released for job {0}")]
    BufferReleased(JobId),
    /// Durable repository write or read failed.
    #[error("repository error: {0}")]
    Repository(String),
    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The scheduler has been shut down.
    #[error("scheduler has been shut down")]
    Shutdown,
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
