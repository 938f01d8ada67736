//! The scheduler control loop and its caller-facing handle.
//!
//! One control thread owns every piece of mutable scheduling state: the
//! queue, the in-flight table, the buffer arena, the repository, the
//! diagnostics sink and the output mailbox. Callers, the timer thread and the
//! workers only ever send it messages, so no job state is shared across
//! threads.
//!
//! Writes go to the repository before the matching diagnostics report is
//! emitted. A failed write is parked per job and retried with backoff; the
//! terminal side effects of that job (report, output delivery, buffer
//! release) wait until the record is durable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PersistencePolicy, SchedulerConfig, TimeoutPolicy};
use crate::core::buffers::{BufferArena, MediaBuffers, MediaProxy};
use crate::core::diagnostics::{DiagnosticsReport, DiagnosticsSink};
use crate::core::feature::FeatureRegistry;
use crate::core::job::{DeferredVideoWork, FailureReason, JobParameters, JobState, StateChange};
use crate::core::mailbox::OutputMailbox;
use crate::core::queue::VideoJobQueue;
use crate::core::repository::{JobRecord, JobRepository};
use crate::core::timer::{TimerCore, TimerEvent, TimerHandle, TimerKind};
use crate::core::worker_pool::{
    Dispatch, ExecutionOutcome, RetryPolicy, WorkerEvent, WorkerId, WorkerPool,
};
use crate::core::SchedulerError;
use crate::util::clock::now_ms;
use crate::util::ids::{FeatureKind, JobId, Priority, SessionId};

/// Loop wake-up interval while no repository write is parked.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// A capture collaborator's request to process buffers later.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Capture session the buffers belong to.
    pub session: SessionId,
    /// Feature to run.
    pub feature: FeatureKind,
    /// Dispatch priority.
    pub priority: Priority,
    /// Source buffers; ownership moves to the scheduler.
    pub source: MediaBuffers,
    /// Feature parameters.
    pub parameters: JobParameters,
    /// Hold the job until this wall-clock time (ms since epoch).
    pub deadline_ms: Option<u128>,
    /// Override of the configured hard timeout.
    pub hard_timeout: Option<Duration>,
}

impl JobRequest {
    /// Request with normal priority and no parameters.
    pub fn new(session: SessionId, feature: impl Into<FeatureKind>, source: MediaBuffers) -> Self {
        Self {
            session,
            feature: feature.into(),
            priority: Priority::NORMAL,
            source,
            parameters: JobParameters::new(),
            deadline_ms: None,
            hard_timeout: None,
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the feature parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: JobParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Hold until an absolute wall-clock deadline.
    #[must_use]
    pub const fn with_deadline_ms(mut self, deadline_ms: u128) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    /// Hold for `delay` from now.
    #[must_use]
    pub fn with_deadline_after(mut self, delay: Duration) -> Self {
        self.deadline_ms = Some(now_ms() + delay.as_millis());
        self
    }

    /// Override the hard timeout.
    #[must_use]
    pub const fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = Some(timeout);
        self
    }
}

/// Point-in-time counters of the control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs waiting in the queue, held ones included.
    pub queued: usize,
    /// Queued jobs still held by a release deadline.
    pub held: usize,
    /// Jobs in `Scheduled` or `Running`.
    pub in_flight: usize,
    /// Concurrency slots in use.
    pub busy_slots: usize,
    /// Configured concurrency budget.
    pub concurrency_budget: usize,
    /// Live worker threads.
    pub workers: usize,
    /// Jobs with a repository write waiting for retry.
    pub pending_writes: usize,
    /// Whether dispatch is paused.
    pub paused: bool,
    /// Jobs accepted since start.
    pub submitted: u64,
    /// Jobs completed since start.
    pub completed: u64,
    /// Jobs failed since start.
    pub failed: u64,
    /// Jobs canceled since start.
    pub canceled: u64,
}

enum Command {
    Submit {
        request: JobRequest,
        reply: Sender<Result<JobId, SchedulerError>>,
    },
    Cancel {
        job_id: JobId,
        reply: Sender<Result<JobState, SchedulerError>>,
    },
    Query {
        job_id: JobId,
        reply: Sender<Result<Option<JobState>, SchedulerError>>,
    },
    UpdatePriority {
        job_id: JobId,
        priority: Priority,
        reply: Sender<Result<(), SchedulerError>>,
    },
    Purge {
        job_id: JobId,
        reply: Sender<Result<bool, SchedulerError>>,
    },
    SetPaused {
        paused: bool,
        reply: Sender<()>,
    },
    Stats {
        reply: Sender<SchedulerStats>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

/// Handle to a running scheduler.
///
/// Every method is a round trip to the control thread. Dropping the handle
/// shuts the scheduler down; jobs that have not finished stay in the
/// repository and are recovered by the next [`Scheduler::start`].
pub struct Scheduler {
    commands: Sender<Command>,
    control: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Recover persisted work and start the control, timer and worker threads.
    ///
    /// # Errors
    ///
    /// Invalid configuration, a repository that cannot be listed, or threads
    /// that cannot be spawned.
    pub fn start(
        config: SchedulerConfig,
        registry: FeatureRegistry,
        repository: Box<dyn JobRepository>,
        proxy: Arc<dyn MediaProxy>,
        diagnostics: Box<dyn DiagnosticsSink>,
        mailbox: Box<dyn OutputMailbox>,
    ) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::Config)?;
        let (commands_tx, commands_rx) = unbounded();
        let mut control = ControlLoop::new(
            config,
            registry,
            repository,
            proxy,
            diagnostics,
            mailbox,
            commands_rx,
        )?;
        control.recover()?;

        let control = thread::Builder::new()
            .name("dv-scheduler".into())
            .spawn(move || control.run())
            .map_err(|e| SchedulerError::Backend(format!("failed to spawn control loop: {e}")))?;

        Ok(Self {
            commands: commands_tx,
            control: Some(control),
        })
    }

    /// Accept a job. The record is persisted at `Pending` before this returns.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidJob`] for an unknown feature or empty source,
    /// [`SchedulerError::QueueFull`] at capacity, [`SchedulerError::Repository`]
    /// if the record could not be persisted under the durable policy.
    pub fn submit_job(&self, request: JobRequest) -> Result<JobId, SchedulerError> {
        self.call(|reply| Command::Submit { request, reply })?
    }

    /// Request cancellation and return the job's state after the request.
    ///
    /// Pending and scheduled jobs are canceled at once. A running job stays
    /// `Running` until its feature stops or the cancel grace period runs out.
    /// Terminal jobs are left untouched.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownJob`] if the id was never seen.
    pub fn cancel_job(&self, job_id: &JobId) -> Result<JobState, SchedulerError> {
        let job_id = job_id.clone();
        self.call(|reply| Command::Cancel { job_id, reply })?
    }

    /// Current state, `None` if the job is unknown.
    ///
    /// # Errors
    ///
    /// Repository read failures.
    pub fn query_job(&self, job_id: &JobId) -> Result<Option<JobState>, SchedulerError> {
        let job_id = job_id.clone();
        self.call(|reply| Command::Query { job_id, reply })?
    }

    /// Change the priority of a job that has not finished.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownJob`] or [`SchedulerError::InvalidJob`] for a
    /// terminal job.
    pub fn update_priority(&self, job_id: &JobId, priority: Priority) -> Result<(), SchedulerError> {
        let job_id = job_id.clone();
        self.call(|reply| Command::UpdatePriority {
            job_id,
            priority,
            reply,
        })?
    }

    /// Delete the record of a terminal job. Returns whether a record existed.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidJob`] if the job has not finished or its last
    /// write is still parked.
    pub fn purge_job(&self, job_id: &JobId) -> Result<bool, SchedulerError> {
        let job_id = job_id.clone();
        self.call(|reply| Command::Purge { job_id, reply })?
    }

    /// Stop starting new jobs; running jobs continue.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Shutdown`].
    pub fn pause_dispatch(&self) -> Result<(), SchedulerError> {
        self.call(|reply| Command::SetPaused {
            paused: true,
            reply,
        })
    }

    /// Resume dispatch after [`pause_dispatch`](Self::pause_dispatch).
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Shutdown`].
    pub fn resume_dispatch(&self) -> Result<(), SchedulerError> {
        self.call(|reply| Command::SetPaused {
            paused: false,
            reply,
        })
    }

    /// Snapshot of loop counters.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Shutdown`].
    pub fn stats(&self) -> Result<SchedulerStats, SchedulerError> {
        self.call(|reply| Command::Stats { reply })
    }

    /// Stop the loop, cancel running work and join the control thread.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Shutdown`] if already stopped.
    pub fn shutdown(&mut self) -> Result<(), SchedulerError> {
        let Some(control) = self.control.take() else {
            return Err(SchedulerError::Shutdown);
        };
        let (reply, done) = bounded(1);
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.recv();
        }
        control
            .join()
            .map_err(|_| SchedulerError::Backend("control loop panicked".into()))
    }

    fn call<T>(&self, command: impl FnOnce(Sender<T>) -> Command) -> Result<T, SchedulerError> {
        let (reply, response) = bounded(1);
        self.commands
            .send(command(reply))
            .map_err(|_| SchedulerError::Shutdown)?;
        response.recv().map_err(|_| SchedulerError::Shutdown)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.control.is_some() {
            if let Err(e) = self.shutdown() {
                warn!(error = %e, "scheduler shutdown on drop failed");
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    canceled: u64,
}

struct InFlight {
    work: DeferredVideoWork,
    cancel: CancellationToken,
    worker_id: Option<WorkerId>,
    /// Hard timeout while running, cancel grace once a cancel was requested.
    timer: Option<TimerHandle>,
    cancel_reason: Option<FailureReason>,
}

/// A job canceled before start whose worker still holds its slot.
#[derive(Default)]
struct Detached {
    worker_id: Option<WorkerId>,
    /// Cancel grace armed if the worker started the feature anyway.
    timer: Option<TimerHandle>,
}

/// Side effects of a terminal transition, run once its record is durable.
struct Finalize {
    output: Option<MediaBuffers>,
}

struct PendingWrite {
    record: JobRecord,
    reports: Vec<DiagnosticsReport>,
    finalize: Option<Finalize>,
    attempts: u32,
    retry_at: Instant,
}

enum Ending {
    Complete(MediaBuffers),
    Fail(FailureReason),
    Cancel(FailureReason),
}

struct ControlLoop {
    config: SchedulerConfig,
    registry: FeatureRegistry,
    repository: Box<dyn JobRepository>,
    proxy: Arc<dyn MediaProxy>,
    diagnostics: Box<dyn DiagnosticsSink>,
    mailbox: Box<dyn OutputMailbox>,
    queue: VideoJobQueue,
    arena: BufferArena,
    timers: TimerCore,
    timer_rx: Receiver<TimerEvent>,
    pool: WorkerPool,
    worker_rx: Receiver<WorkerEvent>,
    commands: Receiver<Command>,
    in_flight: HashMap<JobId, InFlight>,
    /// Jobs handed to the pool that still hold a concurrency slot.
    outstanding: HashSet<JobId>,
    detached: HashMap<JobId, Detached>,
    release_timers: HashMap<JobId, TimerHandle>,
    backlog: HashMap<JobId, PendingWrite>,
    next_seq: u64,
    paused: bool,
    running: bool,
    stopped: bool,
    counters: Counters,
}

impl ControlLoop {
    fn new(
        config: SchedulerConfig,
        registry: FeatureRegistry,
        repository: Box<dyn JobRepository>,
        proxy: Arc<dyn MediaProxy>,
        diagnostics: Box<dyn DiagnosticsSink>,
        mailbox: Box<dyn OutputMailbox>,
        commands: Receiver<Command>,
    ) -> Result<Self, SchedulerError> {
        let (timers, timer_rx) = TimerCore::start()?;
        let (worker_tx, worker_rx) = unbounded();
        let pool = WorkerPool::new(config.concurrency_budget, config.thread_stack_size, worker_tx)?;

        Ok(Self {
            queue: VideoJobQueue::new(config.max_queue_depth),
            config,
            registry,
            repository,
            proxy,
            diagnostics,
            mailbox,
            arena: BufferArena::new(),
            timers,
            timer_rx,
            pool,
            worker_rx,
            commands,
            in_flight: HashMap::new(),
            outstanding: HashSet::new(),
            detached: HashMap::new(),
            release_timers: HashMap::new(),
            backlog: HashMap::new(),
            next_seq: 0,
            paused: false,
            running: true,
            stopped: false,
            counters: Counters::default(),
        })
    }

    fn run(mut self) {
        info!(
            budget = self.config.concurrency_budget,
            queued = self.queue.len(),
            "scheduler loop started"
        );
        let commands = self.commands.clone();
        let timer_rx = self.timer_rx.clone();
        let worker_rx = self.worker_rx.clone();

        self.dispatch_ready();
        while self.running {
            let wait = self.backlog_wait().unwrap_or(IDLE_WAIT);
            select! {
                recv(commands) -> msg => match msg {
                    Ok(command) => self.handle_command(command),
                    Err(_) => {
                        info!("scheduler handle dropped, stopping");
                        self.running = false;
                    }
                },
                recv(timer_rx) -> event => match event {
                    Ok(event) => self.on_timer(event),
                    Err(_) => {
                        error!("timer thread stopped, stopping scheduler");
                        self.running = false;
                    }
                },
                recv(worker_rx) -> event => {
                    if let Ok(event) = event {
                        self.on_worker_event(event);
                    }
                },
                default(wait) => {},
            }
            self.retry_backlog(false);
            if self.running {
                self.dispatch_ready();
            }
        }
        self.stop();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { request, reply } => {
                let _ = reply.send(self.submit(request));
            }
            Command::Cancel { job_id, reply } => {
                let _ = reply.send(self.cancel(&job_id));
            }
            Command::Query { job_id, reply } => {
                let _ = reply.send(self.job_state(&job_id));
            }
            Command::UpdatePriority {
                job_id,
                priority,
                reply,
            } => {
                let _ = reply.send(self.update_priority(&job_id, priority));
            }
            Command::Purge { job_id, reply } => {
                let _ = reply.send(self.purge(&job_id));
            }
            Command::SetPaused { paused, reply } => {
                if self.paused != paused {
                    info!(paused, "dispatch gate changed");
                }
                self.paused = paused;
                let _ = reply.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { reply } => {
                self.running = false;
                self.stop();
                let _ = reply.send(());
            }
        }
    }

    // ---- recovery ----

    fn recover(&mut self) -> Result<(), SchedulerError> {
        let mut records = self.repository.list_pending()?;
        records.sort_by_key(|r| (r.created_at_ms, r.submission_seq));

        let mut recovered = 0usize;
        for record in records {
            self.next_seq = self.next_seq.max(record.submission_seq.saturating_add(1));
            let mut work = DeferredVideoWork::from_record(record);
            let reset = match work.reset_for_recovery() {
                Ok(reset) => reset,
                Err(e) => {
                    warn!(error = %e, "skipping unrecoverable record");
                    continue;
                }
            };
            let job_id = work.id().clone();

            if !self.registry.contains(work.feature()) {
                let reason = FailureReason::fatal(format!(
                    "feature `{}` is no longer registered",
                    work.feature()
                ));
                self.terminate(work, Ending::Cancel(reason));
                continue;
            }
            match self.proxy.reacquire(&job_id, work.source_references()) {
                Ok(buffers) => {
                    if let Err(e) = self.arena.insert(job_id.clone(), buffers) {
                        error!(job_id = %job_id, error = %e, "duplicate recovered job");
                        continue;
                    }
                }
                Err(reason) => {
                    warn!(job_id = %job_id, %reason, "source buffers lost across restart");
                    self.terminate(work, Ending::Cancel(reason));
                    continue;
                }
            }

            if let Some(change) = &reset {
                debug!(job_id = %job_id, from = %change.from, "reset in-flight job to pending");
            }
            // Re-persist so a reset Scheduled/Running record is Pending on disk.
            self.commit(&work, Some(DiagnosticsReport::recovered(job_id.clone(), reset)), None);
            let deadline = work.deadline_ms();
            if let Err(e) = self.queue.push(work.clone(), deadline.is_some()) {
                warn!(job_id = %job_id, error = %e, "recovered job does not fit the queue");
                self.terminate(work, Ending::Cancel(FailureReason::fatal(e.to_string())));
                continue;
            }
            if let Some(deadline_ms) = deadline {
                let handle = self
                    .timers
                    .schedule_at_wall_clock(&job_id, deadline_ms, TimerKind::Release);
                self.release_timers.insert(job_id, handle);
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, next_seq = self.next_seq, "recovered persisted jobs");
        }
        Ok(())
    }

    // ---- commands ----

    fn submit(&mut self, request: JobRequest) -> Result<JobId, SchedulerError> {
        if !self.registry.contains(&request.feature) {
            return Err(SchedulerError::InvalidJob(format!(
                "feature `{}` is not registered",
                request.feature
            )));
        }
        if request.source.is_empty() {
            return Err(SchedulerError::InvalidJob("job has no source buffers".into()));
        }
        if request.hard_timeout == Some(Duration::ZERO) {
            return Err(SchedulerError::InvalidJob("hard timeout must be positive".into()));
        }
        if self.queue.len() >= self.queue.max_depth() {
            return Err(SchedulerError::QueueFull(format!(
                "max queue depth {} reached",
                self.queue.max_depth()
            )));
        }

        let job_id = JobId::generate(request.session);
        let seq = self.next_seq;
        let work = DeferredVideoWork::new(
            job_id.clone(),
            request.feature,
            request.priority,
            request.source.references(),
        )
        .with_parameters(request.parameters)
        .with_deadline_ms(request.deadline_ms)
        .with_hard_timeout(request.hard_timeout)
        .with_submission_seq(seq);

        if let Err(e) = self.repository.upsert(&work.to_record()) {
            match self.config.persistence {
                PersistencePolicy::Durable => return Err(e),
                PersistencePolicy::BestEffort => {
                    warn!(job_id = %job_id, error = %e, "submission not persisted (best effort)");
                }
            }
        }
        self.next_seq += 1;
        self.arena.insert(job_id.clone(), request.source)?;

        let deadline = work.deadline_ms();
        let priority = work.priority();
        let feature = work.feature().clone();
        self.queue.push(work, deadline.is_some())?;
        if let Some(deadline_ms) = deadline {
            let handle = self
                .timers
                .schedule_at_wall_clock(&job_id, deadline_ms, TimerKind::Release);
            self.release_timers.insert(job_id.clone(), handle);
        }
        self.report(&DiagnosticsReport::submitted(job_id.clone()));
        self.counters.submitted += 1;
        info!(job_id = %job_id, %feature, priority = priority.0, held = deadline.is_some(), "job submitted");
        Ok(job_id)
    }

    fn cancel(&mut self, job_id: &JobId) -> Result<JobState, SchedulerError> {
        if let Some(work) = self.queue.remove(job_id) {
            if let Some(handle) = self.release_timers.remove(job_id) {
                self.timers.cancel(&handle);
            }
            self.terminate(work, Ending::Cancel(FailureReason::canceled("canceled while pending")));
            return Ok(JobState::Canceled);
        }

        let state = match self.in_flight.get(job_id) {
            Some(flight) => flight.work.state(),
            None => {
                return self
                    .job_state(job_id)?
                    .ok_or_else(|| SchedulerError::UnknownJob(job_id.clone()));
            }
        };
        match state {
            JobState::Scheduled => {
                if let Some(flight) = self.in_flight.remove(job_id) {
                    // Keeps its slot until the worker reports back.
                    flight.cancel.cancel();
                    self.detached.insert(job_id.clone(), Detached::default());
                    self.terminate(
                        flight.work,
                        Ending::Cancel(FailureReason::canceled("canceled before start")),
                    );
                }
                Ok(JobState::Canceled)
            }
            JobState::Running => {
                let grace = self.config.cancel_grace();
                if let Some(flight) = self.in_flight.get_mut(job_id) {
                    if flight.cancel_reason.is_none() {
                        flight.cancel_reason = Some(FailureReason::canceled("canceled while running"));
                        flight.cancel.cancel();
                        if let Some(handle) = flight.timer.take() {
                            self.timers.cancel(&handle);
                        }
                        flight.timer =
                            Some(self.timers.schedule_after(job_id, grace, TimerKind::CancelGrace));
                        info!(job_id = %job_id, grace_ms = self.config.cancel_grace_ms, "cancel requested for running job");
                    }
                }
                Ok(JobState::Running)
            }
            other => Ok(other),
        }
    }

    fn job_state(&self, job_id: &JobId) -> Result<Option<JobState>, SchedulerError> {
        if let Some(work) = self.queue.get(job_id) {
            return Ok(Some(work.state()));
        }
        if let Some(flight) = self.in_flight.get(job_id) {
            return Ok(Some(flight.work.state()));
        }
        if let Some(pending) = self.backlog.get(job_id) {
            return Ok(Some(pending.record.state));
        }
        Ok(self.repository.get(job_id)?.map(|r| r.state))
    }

    fn update_priority(&mut self, job_id: &JobId, priority: Priority) -> Result<(), SchedulerError> {
        if self.queue.reorder_on_priority_change(job_id, priority) {
            if let Some(work) = self.queue.get(job_id).cloned() {
                self.commit(&work, None, None);
            }
            debug!(job_id = %job_id, priority = priority.0, "queued job reprioritised");
            return Ok(());
        }
        if let Some(flight) = self.in_flight.get_mut(job_id) {
            flight.work.set_priority(priority);
            let work = flight.work.clone();
            self.commit(&work, None, None);
            return Ok(());
        }
        match self.job_state(job_id)? {
            Some(state) => Err(SchedulerError::InvalidJob(format!(
                "job {job_id} is already {state}"
            ))),
            None => Err(SchedulerError::UnknownJob(job_id.clone())),
        }
    }

    fn purge(&mut self, job_id: &JobId) -> Result<bool, SchedulerError> {
        if self.queue.contains(job_id) || self.in_flight.contains_key(job_id) {
            return Err(SchedulerError::InvalidJob(format!(
                "job {job_id} has not finished; cancel it first"
            )));
        }
        if self.backlog.contains_key(job_id) {
            return Err(SchedulerError::InvalidJob(format!(
                "job {job_id} still has an unpersisted write"
            )));
        }
        if let Some(record) = self.repository.get(job_id)? {
            if !record.state.is_terminal() {
                return Err(SchedulerError::InvalidJob(format!(
                    "job {job_id} is {} in the repository",
                    record.state
                )));
            }
        }
        let removed = self.repository.remove(job_id)?;
        if !self.detached.contains_key(job_id) {
            self.timers.forget(job_id);
        }
        if removed {
            info!(job_id = %job_id, "job record purged");
        }
        Ok(removed)
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.queue.len(),
            held: self.queue.held_len(),
            in_flight: self.in_flight.len(),
            busy_slots: self.outstanding.len(),
            concurrency_budget: self.config.concurrency_budget,
            workers: self.pool.worker_count(),
            pending_writes: self.backlog.len(),
            paused: self.paused,
            submitted: self.counters.submitted,
            completed: self.counters.completed,
            failed: self.counters.failed,
            canceled: self.counters.canceled,
        }
    }

    // ---- dispatch ----

    fn dispatch_ready(&mut self) {
        while !self.paused && self.outstanding.len() < self.config.concurrency_budget {
            let Some(work) = self.queue.pop_ready() else {
                break;
            };
            self.dispatch(work);
        }
    }

    fn dispatch(&mut self, mut work: DeferredVideoWork) {
        let job_id = work.id().clone();
        let Some(feature) = self.registry.get(work.feature()) else {
            let reason = FailureReason::fatal(format!("feature `{}` is not registered", work.feature()));
            self.terminate(work, Ending::Cancel(reason));
            return;
        };
        let Some(source) = self.arena.lend(&job_id) else {
            self.terminate(work, Ending::Cancel(FailureReason::fatal("source buffers missing")));
            return;
        };
        let change = match work.schedule() {
            Ok(change) => change,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "cannot schedule job");
                return;
            }
        };
        self.commit(&work, Some(DiagnosticsReport::transition(job_id.clone(), change, None)), None);

        let cancel = CancellationToken::new();
        let dispatch = Dispatch {
            job_id: job_id.clone(),
            feature,
            source,
            parameters: work.parameters().clone(),
            cancel: cancel.clone(),
            retry: RetryPolicy {
                max_retries: self.config.max_transient_retries,
                backoff: self.config.retry_backoff,
            },
        };
        if let Err(e) = self.pool.dispatch(dispatch) {
            error!(job_id = %job_id, error = %e, "worker pool rejected job");
            self.terminate(work, Ending::Cancel(FailureReason::fatal(e.to_string())));
            return;
        }
        self.outstanding.insert(job_id.clone());
        self.in_flight.insert(
            job_id,
            InFlight {
                work,
                cancel,
                worker_id: None,
                timer: None,
                cancel_reason: None,
            },
        );
    }

    // ---- events ----

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started { job_id, worker_id } => self.on_started(&job_id, worker_id),
            WorkerEvent::AttemptStarted { job_id, attempt } => self.on_attempt(&job_id, attempt),
            WorkerEvent::Finished {
                job_id,
                worker_id,
                outcome,
            } => self.on_finished(&job_id, worker_id, outcome),
        }
    }

    fn on_started(&mut self, job_id: &JobId, worker_id: WorkerId) {
        let default_timeout = self.config.hard_timeout();
        let Some(flight) = self.in_flight.get_mut(job_id) else {
            if let Some(detached) = self.detached.get_mut(job_id) {
                // The worker passed its cancel check before the cancel landed.
                let grace = self.config.cancel_grace();
                detached.worker_id = Some(worker_id);
                detached.timer = Some(self.timers.schedule_after(job_id, grace, TimerKind::CancelGrace));
                warn!(job_id = %job_id, worker_id, "canceled job started on worker; arming cancel grace");
                return;
            }
            debug!(job_id = %job_id, worker_id, "start of a job that already ended");
            return;
        };
        let change = match flight.work.start() {
            Ok(change) => change,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "cannot start job");
                return;
            }
        };
        flight.work.record_attempt(1);
        flight.worker_id = Some(worker_id);
        let timeout = flight.work.hard_timeout().unwrap_or(default_timeout);
        flight.timer = Some(self.timers.schedule_after(job_id, timeout, TimerKind::HardTimeout));
        let work = flight.work.clone();
        debug!(job_id = %job_id, worker_id, timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "job running");
        self.commit(&work, Some(DiagnosticsReport::transition(job_id.clone(), change, None)), None);
    }

    fn on_attempt(&mut self, job_id: &JobId, attempt: u32) {
        let default_timeout = self.config.hard_timeout();
        let per_attempt = self.config.timeout_policy == TimeoutPolicy::PerAttempt;
        let Some(flight) = self.in_flight.get_mut(job_id) else {
            return;
        };
        flight.work.record_attempt(attempt);
        if per_attempt && flight.cancel_reason.is_none() {
            let timeout = flight.work.hard_timeout().unwrap_or(default_timeout);
            flight.timer = Some(self.timers.schedule_after(job_id, timeout, TimerKind::HardTimeout));
        }
        let work = flight.work.clone();
        debug!(job_id = %job_id, attempt, "retry attempt started");
        self.commit(&work, None, None);
    }

    fn on_finished(&mut self, job_id: &JobId, worker_id: WorkerId, outcome: ExecutionOutcome) {
        self.outstanding.remove(job_id);
        if let Some(detached) = self.detached.remove(job_id) {
            if let Some(handle) = &detached.timer {
                self.timers.cancel(handle);
            }
            debug!(job_id = %job_id, worker_id, ?outcome, "worker released slot of canceled job");
            return;
        }
        let Some(flight) = self.in_flight.remove(job_id) else {
            debug!(job_id = %job_id, worker_id, "discarding outcome of a job that already ended");
            return;
        };
        if let Some(handle) = &flight.timer {
            self.timers.cancel(handle);
        }
        let ending = match (outcome, flight.cancel_reason) {
            (_, Some(reason)) => Ending::Cancel(reason),
            (ExecutionOutcome::Completed(output), None) => Ending::Complete(output),
            (ExecutionOutcome::Failed(reason), None) => {
                if flight.work.state() == JobState::Running {
                    Ending::Fail(reason)
                } else {
                    Ending::Cancel(reason)
                }
            }
            (ExecutionOutcome::Canceled | ExecutionOutcome::Skipped, None) => {
                Ending::Cancel(FailureReason::canceled("feature stopped on cancellation"))
            }
        };
        self.terminate(flight.work, ending);
    }

    fn on_timer(&mut self, event: TimerEvent) {
        match event.kind {
            TimerKind::Release => {
                let live = self
                    .release_timers
                    .get(&event.job_id)
                    .is_some_and(|h| event.matches(h));
                if !live {
                    debug!(job_id = %event.job_id, "stale release timer");
                    return;
                }
                self.release_timers.remove(&event.job_id);
                if self.queue.release_hold(&event.job_id) {
                    debug!(job_id = %event.job_id, "job released for dispatch");
                }
            }
            TimerKind::HardTimeout | TimerKind::CancelGrace => {
                let Some(flight) = self.in_flight.get(&event.job_id) else {
                    self.reclaim_detached(&event);
                    return;
                };
                if !flight.timer.as_ref().is_some_and(|h| event.matches(h)) {
                    debug!(job_id = %event.job_id, "stale execution timer");
                    return;
                }
                let reason = match event.kind {
                    TimerKind::HardTimeout => {
                        let limit = flight.work.hard_timeout().unwrap_or_else(|| self.config.hard_timeout());
                        FailureReason::timeout(format!("hard timeout of {} ms elapsed", limit.as_millis()))
                    }
                    _ => flight.cancel_reason.clone().unwrap_or_else(|| {
                        FailureReason::canceled("feature ignored cancellation")
                    }),
                };
                self.force_cancel(&event.job_id, reason);
            }
        }
    }

    /// Free the slot of a canceled job whose feature outlived its grace.
    fn reclaim_detached(&mut self, event: &TimerEvent) {
        let live = self
            .detached
            .get(&event.job_id)
            .is_some_and(|d| d.timer.as_ref().is_some_and(|h| event.matches(h)));
        if !live {
            return;
        }
        let Some(detached) = self.detached.remove(&event.job_id) else {
            return;
        };
        self.outstanding.remove(&event.job_id);
        if let Some(worker_id) = detached.worker_id {
            if let Err(e) = self.pool.retire(worker_id) {
                error!(worker_id, error = %e, "failed to replace stuck worker");
            }
        }
        warn!(job_id = %event.job_id, "canceled job ignored cancellation; worker replaced");
    }

    /// Cancel a running job without waiting for its feature.
    fn force_cancel(&mut self, job_id: &JobId, reason: FailureReason) {
        let Some(flight) = self.in_flight.remove(job_id) else {
            return;
        };
        flight.cancel.cancel();
        self.outstanding.remove(job_id);
        if let Some(worker_id) = flight.worker_id {
            if let Err(e) = self.pool.retire(worker_id) {
                error!(worker_id, error = %e, "failed to replace stuck worker");
            }
        }
        warn!(job_id = %job_id, %reason, "job force-canceled");
        self.terminate(flight.work, Ending::Cancel(reason));
    }

    // ---- persistence ----

    fn terminate(&mut self, mut work: DeferredVideoWork, ending: Ending) {
        let job_id = work.id().clone();
        let result: Result<(StateChange, Option<MediaBuffers>), SchedulerError> = match ending {
            Ending::Complete(output) => work.complete(output.references()).map(|c| (c, Some(output))),
            Ending::Fail(reason) => work.fail(reason).map(|c| (c, None)),
            Ending::Cancel(reason) => work.cancel(reason).map(|c| (c, None)),
        };
        let (change, output) = match result {
            Ok(done) => done,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "terminal transition rejected");
                return;
            }
        };
        match change.to {
            JobState::Completed => self.counters.completed += 1,
            JobState::Failed => self.counters.failed += 1,
            _ => self.counters.canceled += 1,
        }
        if let Some(handle) = self.release_timers.remove(&job_id) {
            self.timers.cancel(&handle);
        }
        match work.failure() {
            Some(reason) => info!(job_id = %job_id, state = %change.to, %reason, "job finished"),
            None => info!(job_id = %job_id, state = %change.to, "job finished"),
        }
        let report = DiagnosticsReport::transition(job_id, change, work.failure().cloned());
        self.commit(&work, Some(report), Some(Finalize { output }));
    }

    fn commit(
        &mut self,
        work: &DeferredVideoWork,
        report: Option<DiagnosticsReport>,
        finalize: Option<Finalize>,
    ) {
        let record = work.to_record();
        let job_id = record.job_id.clone();
        if let Some(pending) = self.backlog.get_mut(&job_id) {
            // Keep write order per job: the parked write goes first.
            pending.record = record;
            pending.reports.extend(report);
            if finalize.is_some() {
                pending.finalize = finalize;
            }
            return;
        }
        match self.repository.upsert(&record) {
            Ok(()) => self.after_persist(&job_id, report.into_iter().collect(), finalize),
            Err(e) => match self.config.persistence {
                PersistencePolicy::BestEffort => {
                    warn!(job_id = %job_id, error = %e, "repository write failed (best effort)");
                    self.after_persist(&job_id, report.into_iter().collect(), finalize);
                }
                PersistencePolicy::Durable => {
                    let delay = self.config.repository_backoff.delay(1);
                    warn!(job_id = %job_id, error = %e, retry_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "repository write failed, parking");
                    self.backlog.insert(
                        job_id,
                        PendingWrite {
                            record,
                            reports: report.into_iter().collect(),
                            finalize,
                            attempts: 1,
                            retry_at: Instant::now() + delay,
                        },
                    );
                }
            },
        }
    }

    fn after_persist(
        &mut self,
        job_id: &JobId,
        reports: Vec<DiagnosticsReport>,
        finalize: Option<Finalize>,
    ) {
        for report in &reports {
            self.report(report);
        }
        let Some(Finalize { output }) = finalize else {
            return;
        };
        if let Some(output) = output {
            if let Err(e) = self.mailbox.deliver(job_id, output) {
                warn!(job_id = %job_id, error = %e, "output delivery failed");
            }
        }
        if self.arena.contains(job_id) {
            if let Err(e) = self.arena.release(job_id, self.proxy.as_ref()) {
                error!(job_id = %job_id, error = %e, "buffer release failed");
            }
        }
        self.timers.forget(job_id);
    }

    fn retry_backlog(&mut self, force: bool) {
        if self.backlog.is_empty() {
            return;
        }
        let now = Instant::now();
        let due: Vec<JobId> = self
            .backlog
            .iter()
            .filter(|(_, pending)| force || pending.retry_at <= now)
            .map(|(job_id, _)| job_id.clone())
            .collect();
        for job_id in due {
            let Some(mut pending) = self.backlog.remove(&job_id) else {
                continue;
            };
            match self.repository.upsert(&pending.record) {
                Ok(()) => {
                    info!(job_id = %job_id, attempts = pending.attempts, "parked repository write persisted");
                    self.after_persist(&job_id, pending.reports, pending.finalize);
                }
                Err(e) => {
                    pending.attempts += 1;
                    let delay = self.config.repository_backoff.delay(pending.attempts);
                    pending.retry_at = now + delay;
                    warn!(job_id = %job_id, attempts = pending.attempts, error = %e, "repository write still failing");
                    self.backlog.insert(job_id, pending);
                }
            }
        }
    }

    fn backlog_wait(&self) -> Option<Duration> {
        self.backlog
            .values()
            .map(|pending| pending.retry_at)
            .min()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn report(&mut self, report: &DiagnosticsReport) {
        if let Err(e) = self.diagnostics.report(report) {
            warn!(job_id = %report.job_id, error = %e, "diagnostics sink rejected report");
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for flight in self.in_flight.values() {
            flight.cancel.cancel();
        }
        self.retry_backlog(true);
        for (job_id, pending) in &self.backlog {
            error!(job_id = %job_id, state = %pending.record.state, "repository write lost at shutdown");
        }
        self.pool.shutdown();
        self.timers.shutdown();
        info!(
            queued = self.queue.len(),
            in_flight = self.in_flight.len(),
            "scheduler loop stopped"
        );
    }
}
