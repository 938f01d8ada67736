//! In-process stand-in for the cross-process media proxy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{FailureReason, MediaBuffer, MediaBuffers, MediaProxy};
use crate::util::ids::JobId;

#[derive(Default)]
struct ProxyState {
    buffers: HashMap<String, Vec<u8>>,
    released: HashSet<JobId>,
}

/// Keeps buffer contents by reference so they can be reacquired after a
/// simulated restart. Clones share the same storage.
#[derive(Clone, Default)]
pub struct InMemoryMediaProxy {
    state: Arc<Mutex<ProxyState>>,
}

impl InMemoryMediaProxy {
    /// Create an empty proxy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register captured buffers, as the camera pipeline would.
    pub fn store(&self, buffers: &MediaBuffers) {
        let mut state = self.state.lock();
        for buffer in buffers.buffers() {
            state
                .buffers
                .insert(buffer.reference.clone(), buffer.data.clone());
        }
    }

    /// Drop a buffer, as if its handle became invalid.
    pub fn invalidate(&self, reference: &str) -> bool {
        self.state.lock().buffers.remove(reference).is_some()
    }

    /// Whether the buffers of `job_id` were handed back.
    #[must_use]
    pub fn was_released(&self, job_id: &JobId) -> bool {
        self.state.lock().released.contains(job_id)
    }

    /// Number of jobs whose buffers were handed back.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.state.lock().released.len()
    }
}

impl MediaProxy for InMemoryMediaProxy {
    fn reacquire(&self, job_id: &JobId, references: &[String]) -> Result<MediaBuffers, FailureReason> {
        let state = self.state.lock();
        references
            .iter()
            .map(|reference| {
                state
                    .buffers
                    .get(reference)
                    .map(|data| MediaBuffer::new(reference.clone(), data.clone()))
                    .ok_or_else(|| {
                        FailureReason::fatal(format!("buffer `{reference}` of {job_id} is gone"))
                    })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(MediaBuffers::new)
    }

    fn release(&self, job_id: &JobId, buffers: &MediaBuffers) {
        let mut state = self.state.lock();
        for buffer in buffers.buffers() {
            state.buffers.remove(&buffer.reference);
        }
        state.released.insert(job_id.clone());
    }
}
