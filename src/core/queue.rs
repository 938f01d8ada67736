//! In-memory ordering over pending work.
//!
//! Order is priority descending, then insertion sequence ascending. The
//! sequence counter is never reused, so a priority change keeps a job's place
//! among its new peers relative to when it was first queued.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::core::job::DeferredVideoWork;
use crate::core::SchedulerError;
use crate::util::ids::{JobId, Priority, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    seq: u64,
}

struct QueueEntry {
    key: QueueKey,
    work: DeferredVideoWork,
    /// Deferred until its release timer fires.
    held: bool,
}

/// Ordered collection of pending jobs keyed by job id.
pub struct VideoJobQueue {
    max_depth: usize,
    next_seq: u64,
    order: BTreeMap<QueueKey, JobId>,
    entries: HashMap<JobId, QueueEntry>,
}

impl VideoJobQueue {
    /// Create a queue accepting at most `max_depth` jobs.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            next_seq: 0,
            order: BTreeMap::new(),
            entries: HashMap::new(),
        }
    }

    /// Add a job. `held` jobs are skipped by [`pop_ready`](Self::pop_ready)
    /// until [`release_hold`](Self::release_hold) is called.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::QueueFull`] at capacity, [`SchedulerError::InvalidJob`]
    /// if the job is already queued.
    pub fn push(&mut self, work: DeferredVideoWork, held: bool) -> Result<(), SchedulerError> {
        if self.entries.len() >= self.max_depth {
            return Err(SchedulerError::QueueFull(format!(
                "max queue depth {} reached",
                self.max_depth
            )));
        }
        if self.entries.contains_key(work.id()) {
            return Err(SchedulerError::InvalidJob(format!(
                "job {} is already queued",
                work.id()
            )));
        }
        let key = QueueKey {
            priority: Reverse(work.priority()),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let job_id = work.id().clone();
        self.order.insert(key, job_id.clone());
        self.entries.insert(job_id, QueueEntry { key, work, held });
        Ok(())
    }

    /// Remove and return the highest-ordered job that is not held back.
    ///
    /// A held job also blocks later jobs of its session at the same priority,
    /// so submission order within a session is kept among equal priorities.
    pub fn pop_ready(&mut self) -> Option<DeferredVideoWork> {
        let chosen = {
            let mut blocked: HashSet<(&SessionId, Priority)> = HashSet::new();
            let mut chosen = None;
            for job_id in self.order.values() {
                let entry = &self.entries[job_id];
                let lane = (entry.work.session(), entry.work.priority());
                if entry.held {
                    blocked.insert(lane);
                    continue;
                }
                if blocked.contains(&lane) {
                    continue;
                }
                chosen = Some(job_id.clone());
                break;
            }
            chosen
        };
        self.remove(&chosen?)
    }

    /// Remove a job regardless of hold state.
    pub fn remove(&mut self, job_id: &JobId) -> Option<DeferredVideoWork> {
        let entry = self.entries.remove(job_id)?;
        self.order.remove(&entry.key);
        Some(entry.work)
    }

    /// Move a job to its place under `new_priority`. Returns `false` if not queued.
    pub fn reorder_on_priority_change(&mut self, job_id: &JobId, new_priority: Priority) -> bool {
        let Some(entry) = self.entries.get_mut(job_id) else {
            return false;
        };
        self.order.remove(&entry.key);
        entry.key.priority = Reverse(new_priority);
        entry.work.set_priority(new_priority);
        self.order.insert(entry.key, job_id.clone());
        true
    }

    /// Make a held job eligible. Returns `false` if not queued or not held.
    pub fn release_hold(&mut self, job_id: &JobId) -> bool {
        match self.entries.get_mut(job_id) {
            Some(entry) if entry.held => {
                entry.held = false;
                true
            }
            _ => false,
        }
    }

    /// Borrow a queued job.
    #[must_use]
    pub fn get(&self, job_id: &JobId) -> Option<&DeferredVideoWork> {
        self.entries.get(job_id).map(|e| &e.work)
    }

    /// Whether the job is queued.
    #[must_use]
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.entries.contains_key(job_id)
    }

    /// Whether a queued job is held.
    #[must_use]
    pub fn is_held(&self, job_id: &JobId) -> bool {
        self.entries.get(job_id).is_some_and(|e| e.held)
    }

    /// Job ids in queue order.
    #[must_use]
    pub fn job_ids(&self) -> Vec<JobId> {
        self.order.values().cloned().collect()
    }

    /// Number of queued jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of held jobs.
    #[must_use]
    pub fn held_len(&self) -> usize {
        self.entries.values().filter(|e| e.held).count()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum depth.
    #[must_use]
    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }
}
