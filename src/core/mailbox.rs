//! Destination for the output buffers of completed jobs.

use crate::core::buffers::MediaBuffers;
use crate::core::SchedulerError;
use crate::util::ids::JobId;

/// Receives ownership of a completed job's output buffers.
///
/// Delivery happens after the completion has been persisted, so a consumer
/// that finds output here can rely on the repository reporting `Completed`.
pub trait OutputMailbox: Send {
    /// Take ownership of `output` for `job_id`.
    ///
    /// # Errors
    ///
    /// Backend failures; the scheduler logs them and drops the output.
    fn deliver(&mut self, job_id: &JobId, output: MediaBuffers) -> Result<(), SchedulerError>;
}
