//! Durable job metadata storage.
//!
//! The repository only ever stores [`JobRecord`]s. Media bytes stay with the
//! media proxy and are referenced by path or handle name.

use serde::{Deserialize, Serialize};

use crate::core::job::{FailureReason, JobParameters, JobState};
use crate::core::SchedulerError;
use crate::util::ids::{FeatureKind, JobId, Priority};

/// Persisted metadata for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identifier.
    pub job_id: JobId,
    /// Feature that processes the job.
    pub feature_kind: FeatureKind,
    /// Priority at the time of the write.
    pub priority: Priority,
    /// Feature parameters.
    #[serde(default)]
    pub parameters: JobParameters,
    /// References to the source buffers.
    pub source_references: Vec<String>,
    /// Creation time, ms since epoch.
    pub created_at_ms: u128,
    /// Hold deadline, ms since epoch.
    pub deadline_ms: Option<u128>,
    /// Per-job hard timeout in milliseconds.
    pub hard_timeout_ms: Option<u64>,
    /// Submission order.
    #[serde(default)]
    pub submission_seq: u64,
    /// Execution attempts started so far.
    #[serde(default)]
    pub attempts: u32,
    /// Last durable state.
    pub state: JobState,
    /// Time of the last state change, ms since epoch.
    pub state_changed_at_ms: u128,
    /// Failure reason for failed or canceled jobs.
    pub failure_reason: Option<FailureReason>,
    /// Output references for completed jobs.
    pub result_references: Option<Vec<String>>,
}

/// Durable key-value store of job records keyed by job id.
///
/// Every method must be atomic with respect to a single record: a reader never
/// observes a partially written record.
pub trait JobRepository: Send {
    /// Insert or replace the record for `record.job_id`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Repository`] if the write was not made durable.
    fn upsert(&mut self, record: &JobRecord) -> Result<(), SchedulerError>;

    /// Fetch a record.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Repository`] on storage failure.
    fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, SchedulerError>;

    /// Every record whose state is not terminal.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Repository`] on storage failure.
    fn list_pending(&self) -> Result<Vec<JobRecord>, SchedulerError>;

    /// Delete a record. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Repository`] if the delete was not made durable.
    fn remove(&mut self, job_id: &JobId) -> Result<bool, SchedulerError>;
}
