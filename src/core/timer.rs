//! Deadline-ordered timer registry with a dedicated delivery thread.
//!
//! Each job id has at most one live timer. Scheduling again bumps the job's
//! generation counter, so an older entry still sitting in the heap is dropped
//! when it comes due instead of firing. Delivery only pushes a [`TimerEvent`]
//! into a channel; the scheduler loop decides what the expiry means.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::core::SchedulerError;
use crate::util::clock::instant_from_wall_clock;
use crate::util::ids::JobId;

/// What an expiring timer means for its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// A held job becomes eligible for dispatch.
    Release,
    /// A running job exceeded its hard timeout.
    HardTimeout,
    /// A running job did not honour a cancel request in time.
    CancelGrace,
}

/// Handle to a scheduled timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerHandle {
    /// Job the timer belongs to.
    pub job_id: JobId,
    /// Generation assigned when the timer was scheduled.
    pub generation: u64,
    /// Timer purpose.
    pub kind: TimerKind,
}

/// Delivered when a live timer expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    /// Job the timer belongs to.
    pub job_id: JobId,
    /// Generation of the expired timer.
    pub generation: u64,
    /// Timer purpose.
    pub kind: TimerKind,
}

impl TimerEvent {
    /// Whether this event was produced by `handle`.
    #[must_use]
    pub fn matches(&self, handle: &TimerHandle) -> bool {
        self.job_id == handle.job_id && self.generation == handle.generation
    }
}

struct Entry {
    deadline: Instant,
    job_id: JobId,
    generation: u64,
    kind: TimerKind,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Latest generation handed out per job.
    generations: HashMap<JobId, u64>,
    /// Generation of the live (not canceled, not fired) timer per job.
    live: HashMap<JobId, u64>,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

/// Deadline-ordered timer registry.
pub struct TimerCore {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl TimerCore {
    /// Start the delivery thread. Expired timers are sent on the returned receiver.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Backend`] if the thread cannot be spawned.
    pub fn start() -> Result<(Self, Receiver<TimerEvent>), SchedulerError> {
        let (tx, rx) = unbounded();
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            condvar: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("dv-timer".into())
            .spawn(move || delivery_loop(&thread_shared, &tx))
            .map_err(|e| SchedulerError::Backend(format!("failed to spawn timer thread: {e}")))?;
        Ok((
            Self {
                shared,
                thread: Some(thread),
            },
            rx,
        ))
    }

    /// Schedule a timer, invalidating any previous one for `job_id`.
    pub fn schedule(&self, job_id: &JobId, deadline: Instant, kind: TimerKind) -> TimerHandle {
        let mut state = self.shared.state.lock();
        let generation = {
            let counter = state.generations.entry(job_id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        state.live.insert(job_id.clone(), generation);
        state.heap.push(Reverse(Entry {
            deadline,
            job_id: job_id.clone(),
            generation,
            kind,
        }));
        drop(state);
        self.shared.condvar.notify_one();
        trace!(job_id = %job_id, generation, ?kind, "timer scheduled");
        TimerHandle {
            job_id: job_id.clone(),
            generation,
            kind,
        }
    }

    /// Schedule relative to now.
    pub fn schedule_after(&self, job_id: &JobId, delay: Duration, kind: TimerKind) -> TimerHandle {
        self.schedule(job_id, Instant::now() + delay, kind)
    }

    /// Schedule at a wall-clock deadline (ms since epoch). Past deadlines fire at once.
    pub fn schedule_at_wall_clock(
        &self,
        job_id: &JobId,
        deadline_ms: u128,
        kind: TimerKind,
    ) -> TimerHandle {
        self.schedule(job_id, instant_from_wall_clock(deadline_ms), kind)
    }

    /// Cancel a timer. Returns `false` if it already fired or was superseded.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let mut state = self.shared.state.lock();
        if state.live.get(&handle.job_id) == Some(&handle.generation) {
            state.live.remove(&handle.job_id);
            true
        } else {
            false
        }
    }

    /// Whether `handle` is the live timer of its job.
    #[must_use]
    pub fn is_live(&self, handle: &TimerHandle) -> bool {
        self.shared.state.lock().live.get(&handle.job_id) == Some(&handle.generation)
    }

    /// Drop all bookkeeping for a job that will never be scheduled again.
    pub fn forget(&self, job_id: &JobId) {
        let mut state = self.shared.state.lock();
        state.live.remove(job_id);
        state.generations.remove(job_id);
    }

    /// Number of live timers.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.shared.state.lock().live.len()
    }

    /// Stop the delivery thread and wait for it.
    pub fn shutdown(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.condvar.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("timer delivery thread panicked");
            }
        }
    }
}

impl Drop for TimerCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn delivery_loop(shared: &TimerShared, tx: &Sender<TimerEvent>) {
    debug!("timer delivery thread started");
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let next_deadline = state.heap.peek().map(|Reverse(entry)| entry.deadline);
        match next_deadline {
            None => {
                shared.condvar.wait(&mut state);
            }
            Some(deadline) if deadline > Instant::now() => {
                let _ = shared.condvar.wait_until(&mut state, deadline);
            }
            Some(_) => {
                let Some(Reverse(entry)) = state.heap.pop() else {
                    continue;
                };
                if state.live.get(&entry.job_id) != Some(&entry.generation) {
                    trace!(job_id = %entry.job_id, generation = entry.generation, "dropping stale timer");
                    continue;
                }
                state.live.remove(&entry.job_id);
                let event = TimerEvent {
                    job_id: entry.job_id,
                    generation: entry.generation,
                    kind: entry.kind,
                };
                if tx.send(event).is_err() {
                    debug!("timer receiver dropped, stopping delivery");
                    break;
                }
            }
        }
    }
    debug!("timer delivery thread exiting");
}
