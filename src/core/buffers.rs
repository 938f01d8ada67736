//! Media buffer handles and the per-job buffer arena.
//!
//! Captured buffers arrive from the media proxy as opaque handles. The
//! scheduler holds exactly one token per job in a [`BufferArena`] until the job
//! is finalised; features only ever see a borrow for the duration of
//! [`Feature::execute`](crate::core::Feature::execute).

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::job::FailureReason;
use crate::core::SchedulerError;
use crate::util::ids::JobId;

/// One captured or produced buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBuffer {
    /// Stable reference (path or proxy handle name) that is persisted.
    pub reference: String,
    /// Buffer contents.
    pub data: Vec<u8>,
}

impl MediaBuffer {
    /// Create a buffer.
    pub fn new(reference: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            reference: reference.into(),
            data,
        }
    }
}

/// Ordered set of buffers belonging to one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaBuffers {
    buffers: Vec<MediaBuffer>,
}

impl MediaBuffers {
    /// Wrap a list of buffers.
    #[must_use]
    pub const fn new(buffers: Vec<MediaBuffer>) -> Self {
        Self { buffers }
    }

    /// Single-buffer convenience constructor.
    pub fn single(reference: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(vec![MediaBuffer::new(reference, data)])
    }

    /// References of every buffer, in order.
    #[must_use]
    pub fn references(&self) -> Vec<String> {
        self.buffers.iter().map(|b| b.reference.clone()).collect()
    }

    /// Borrow the buffers.
    #[must_use]
    pub fn buffers(&self) -> &[MediaBuffer] {
        &self.buffers
    }

    /// Number of buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total payload size in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.buffers.iter().map(|b| b.data.len()).sum()
    }

    /// Consume into the underlying list.
    #[must_use]
    pub fn into_inner(self) -> Vec<MediaBuffer> {
        self.buffers
    }
}

/// Boundary to the cross-process media proxy that backs source buffers.
pub trait MediaProxy: Send + Sync {
    /// Re-open the buffers behind `references` after a process restart.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`FailureReason`] if the handles are no longer valid.
    fn reacquire(&self, job_id: &JobId, references: &[String]) -> Result<MediaBuffers, FailureReason>;

    /// Hand the buffers of a finished job back to the proxy.
    fn release(&self, job_id: &JobId, buffers: &MediaBuffers) {
        let _ = (job_id, buffers);
    }
}

/// Proxy that cannot reacquire anything; releases are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMediaProxy;

impl MediaProxy for NoopMediaProxy {
    fn reacquire(&self, job_id: &JobId, _references: &[String]) -> Result<MediaBuffers, FailureReason> {
        Err(FailureReason::fatal(format!(
            "source buffers for {job_id} did not survive the restart"
        )))
    }
}

/// Arena of buffer tokens indexed by job id.
///
/// Each token is released exactly once. The worker executing a job holds a
/// short-lived `Arc` clone that it drops when the feature returns.
#[derive(Default)]
pub struct BufferArena {
    slots: HashMap<JobId, Arc<MediaBuffers>>,
}

impl BufferArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a job's source buffers.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidJob`] if the job already holds a token.
    pub fn insert(&mut self, job_id: JobId, buffers: MediaBuffers) -> Result<(), SchedulerError> {
        if self.slots.contains_key(&job_id) {
            return Err(SchedulerError::InvalidJob(format!(
                "buffers for {job_id} are already registered"
            )));
        }
        self.slots.insert(job_id, Arc::new(buffers));
        Ok(())
    }

    /// Lend the buffers to a worker for one execution.
    #[must_use]
    pub fn lend(&self, job_id: &JobId) -> Option<Arc<MediaBuffers>> {
        self.slots.get(job_id).cloned()
    }

    /// Whether the job still holds its token.
    #[must_use]
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.slots.contains_key(job_id)
    }

    /// Number of live tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no tokens are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Release the token, handing the buffers back to `proxy`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::BufferReleased`] on a second release.
    pub fn release(&mut self, job_id: &JobId, proxy: &dyn MediaProxy) -> Result<(), SchedulerError> {
        let buffers = self
            .slots
            .remove(job_id)
            .ok_or_else(|| SchedulerError::BufferReleased(job_id.clone()))?;
        proxy.release(job_id, &buffers);
        tracing::debug!(job_id = %job_id, bytes = buffers.total_bytes(), "released source buffers");
        Ok(())
    }
}
