//! In-memory job repository.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{JobRecord, JobRepository, SchedulerError};
use crate::util::ids::JobId;

#[derive(Default)]
struct State {
    records: HashMap<JobId, JobRecord>,
    failing_writes: usize,
    writes: u64,
}

/// Repository kept in process memory for development/testing.
///
/// Clones share the same storage, so a clone handed to a second scheduler
/// instance sees everything the first one wrote. That is how tests simulate a
/// restart.
#[derive(Clone, Default)]
pub struct InMemoryJobRepository {
    state: Arc<Mutex<State>>,
}

impl InMemoryJobRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes (upserts and removes) fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    /// Stored record for a job.
    #[must_use]
    pub fn record(&self, job_id: &JobId) -> Option<JobRecord> {
        self.state.lock().records.get(job_id).cloned()
    }

    /// Every stored record, in no particular order.
    #[must_use]
    pub fn records(&self) -> Vec<JobRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }
}

impl State {
    fn take_failure(&mut self) -> Result<(), SchedulerError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(SchedulerError::Repository("injected write failure".into()));
        }
        self.writes += 1;
        Ok(())
    }
}

impl JobRepository for InMemoryJobRepository {
    fn upsert(&mut self, record: &JobRecord) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        state.records.insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, SchedulerError> {
        Ok(self.record(job_id))
    }

    fn list_pending(&self) -> Result<Vec<JobRecord>, SchedulerError> {
        Ok(self
            .state
            .lock()
            .records
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect())
    }

    fn remove(&mut self, job_id: &JobId) -> Result<bool, SchedulerError> {
        let mut state = self.state.lock();
        state.take_failure()?;
        Ok(state.records.remove(job_id).is_some())
    }
}
