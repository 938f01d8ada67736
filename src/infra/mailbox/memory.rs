//! In-memory output mailbox.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{MediaBuffers, OutputMailbox, SchedulerError};
use crate::util::ids::JobId;

/// Collects completed outputs until the consumer takes them.
/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct InMemoryOutputMailbox {
    outputs: Arc<Mutex<HashMap<JobId, MediaBuffers>>>,
}

impl InMemoryOutputMailbox {
    /// Create a new mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the output of a job.
    #[must_use]
    pub fn take(&self, job_id: &JobId) -> Option<MediaBuffers> {
        self.outputs.lock().remove(job_id)
    }

    /// Whether output for `job_id` is waiting.
    #[must_use]
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.outputs.lock().contains_key(job_id)
    }

    /// Number of outputs waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.lock().len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.lock().is_empty()
    }
}

impl OutputMailbox for InMemoryOutputMailbox {
    fn deliver(&mut self, job_id: &JobId, output: MediaBuffers) -> Result<(), SchedulerError> {
        if self.outputs.lock().insert(job_id.clone(), output).is_some() {
            return Err(SchedulerError::InvalidJob(format!(
                "output for {job_id} was delivered twice"
            )));
        }
        Ok(())
    }
}
