//! Worker pool running features on dedicated OS threads.
//!
//! Each worker thread owns a single-threaded tokio runtime, so CPU- or
//! GPU-bound feature work never blocks the scheduler loop. Workers block on a
//! shared crossbeam channel and report back through [`WorkerEvent`]s; they
//! never touch job state themselves.
//!
//! A worker stuck in a feature that ignores cancellation can be retired: it is
//! detached, exits as soon as the feature returns, and a replacement thread
//! takes its place so the pool keeps its size.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BackoffConfig;
use crate::core::buffers::MediaBuffers;
use crate::core::feature::{Feature, FeatureContext, FeatureError};
use crate::core::job::{FailureReason, JobParameters};
use crate::core::SchedulerError;
use crate::util::ids::JobId;

/// Worker thread identifier, never reused within a pool.
pub type WorkerId = usize;

/// Transient failure handling applied inside a worker.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay between attempts.
    pub backoff: BackoffConfig,
}

/// One job handed to the pool.
pub struct Dispatch {
    /// Job being executed.
    pub job_id: JobId,
    /// Feature to run.
    pub feature: Arc<dyn Feature>,
    /// Source buffers lent from the arena.
    pub source: Arc<MediaBuffers>,
    /// Feature parameters.
    pub parameters: JobParameters,
    /// Cooperative cancellation flag shared with the scheduler loop.
    pub cancel: CancellationToken,
    /// Transient retry handling.
    pub retry: RetryPolicy,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The feature produced output.
    Completed(MediaBuffers),
    /// The feature failed fatally or ran out of retries.
    Failed(FailureReason),
    /// The feature observed cancellation and stopped.
    Canceled,
    /// Cancellation was requested before the worker picked the job up.
    Skipped,
}

/// Notifications sent from workers to the scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The first attempt is about to run.
    Started {
        /// Job id.
        job_id: JobId,
        /// Worker executing it.
        worker_id: WorkerId,
    },
    /// A retry attempt (2 or later) is about to run.
    AttemptStarted {
        /// Job id.
        job_id: JobId,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Execution ended; the worker no longer touches the job.
    Finished {
        /// Job id.
        job_id: JobId,
        /// Worker that ran it.
        worker_id: WorkerId,
        /// Result of the execution.
        outcome: ExecutionOutcome,
    },
}

struct WorkerHandle {
    retired: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Fixed-size pool of feature worker threads.
pub struct WorkerPool {
    stack_size: usize,
    task_tx: Option<Sender<Dispatch>>,
    task_rx: Receiver<Dispatch>,
    events_tx: Sender<WorkerEvent>,
    workers: HashMap<WorkerId, WorkerHandle>,
    next_worker_id: WorkerId,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `worker_count` threads reporting into `events_tx`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Config`] for a zero worker count,
    /// [`SchedulerError::Backend`] if a thread cannot be spawned.
    pub fn new(
        worker_count: usize,
        stack_size: usize,
        events_tx: Sender<WorkerEvent>,
    ) -> Result<Self, SchedulerError> {
        if worker_count == 0 {
            return Err(SchedulerError::Config(
                "worker_count must be greater than 0".into(),
            ));
        }
        let (task_tx, task_rx) = unbounded();
        let mut pool = Self {
            stack_size,
            task_tx: Some(task_tx),
            task_rx,
            events_tx,
            workers: HashMap::with_capacity(worker_count),
            next_worker_id: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        for _ in 0..worker_count {
            pool.spawn_worker()?;
        }
        info!(worker_count, "worker pool started");
        Ok(pool)
    }

    /// Queue a job for the next idle worker.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Shutdown`] once the pool is shutting down.
    pub fn dispatch(&self, dispatch: Dispatch) -> Result<(), SchedulerError> {
        let Some(task_tx) = self.task_tx.as_ref() else {
            return Err(SchedulerError::Shutdown);
        };
        let job_id = dispatch.job_id.clone();
        task_tx.send(dispatch).map_err(|_| SchedulerError::Shutdown)?;
        debug!(job_id = %job_id, "job dispatched to worker pool");
        Ok(())
    }

    /// Detach a worker stuck in a feature and spawn a replacement.
    ///
    /// Returns `false` if the worker is unknown or already retired.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Backend`] if the replacement cannot be spawned.
    pub fn retire(&mut self, worker_id: WorkerId) -> Result<bool, SchedulerError> {
        let Some(handle) = self.workers.remove(&worker_id) else {
            return Ok(false);
        };
        handle.retired.store(true, Ordering::Release);
        // Detached: the thread exits once its feature returns.
        drop(handle.join);
        let replacement = self.spawn_worker()?;
        warn!(worker_id, replacement, "retired stuck worker");
        Ok(true)
    }

    /// Number of live (non-retired) workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work and join the workers.
    ///
    /// Dropping the sender unblocks idle workers. Busy workers get two
    /// seconds each before they are detached.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task_tx = None;

        let worker_count = self.workers.len();
        for (worker_id, handle) in self.workers.drain() {
            let (tx, rx) = crossbeam_channel::bounded(1);
            let join = handle.join;
            let joiner = thread::spawn(move || {
                let _ = tx.send(join.join().is_ok());
            });
            match rx.recv_timeout(Duration::from_secs(2)) {
                Ok(true) => debug!(worker_id, "worker joined"),
                Ok(false) => warn!(worker_id, "worker panicked"),
                Err(_) => {
                    warn!(worker_id, "worker did not exit within timeout, detaching");
                    drop(joiner);
                    continue;
                }
            }
            let _ = joiner.join();
        }
        info!(worker_count, "worker pool shut down");
    }

    fn spawn_worker(&mut self) -> Result<WorkerId, SchedulerError> {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let retired = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            id: worker_id,
            task_rx: self.task_rx.clone(),
            events_tx: self.events_tx.clone(),
            retired: Arc::clone(&retired),
            shutdown: Arc::clone(&self.shutdown),
        };
        let join = thread::Builder::new()
            .name(format!("dv-worker-{worker_id}"))
            .stack_size(self.stack_size)
            .spawn(move || worker.run())
            .map_err(|e| SchedulerError::Backend(format!("failed to spawn worker: {e}")))?;
        self.workers.insert(worker_id, WorkerHandle { retired, join });
        Ok(worker_id)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal only; joining here could hang on a stuck feature.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.task_tx = None;
            debug!("worker pool dropped without explicit shutdown, workers detached");
        }
    }
}

struct Worker {
    id: WorkerId,
    task_rx: Receiver<Dispatch>,
    events_tx: Sender<WorkerEvent>,
    retired: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        debug!(worker_id = self.id, "worker thread started");
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!(worker_id = self.id, error = %e, "failed to create worker runtime");
                return;
            }
        };

        while !self.retired.load(Ordering::Acquire) {
            let Ok(dispatch) = self.task_rx.recv() else {
                break;
            };
            let job_id = dispatch.job_id.clone();
            let outcome = if dispatch.cancel.is_cancelled() || self.shutdown.load(Ordering::Acquire)
            {
                debug!(worker_id = self.id, job_id = %job_id, "skipping canceled job");
                ExecutionOutcome::Skipped
            } else {
                self.send(WorkerEvent::Started {
                    job_id: job_id.clone(),
                    worker_id: self.id,
                });
                rt.block_on(self.execute(&dispatch))
            };
            drop(dispatch);
            self.send(WorkerEvent::Finished {
                job_id,
                worker_id: self.id,
                outcome,
            });
        }
        debug!(worker_id = self.id, "worker thread exiting");
    }

    async fn execute(&self, dispatch: &Dispatch) -> ExecutionOutcome {
        let mut attempt = 1;
        loop {
            if attempt > 1 {
                self.send(WorkerEvent::AttemptStarted {
                    job_id: dispatch.job_id.clone(),
                    attempt,
                });
            }
            let ctx = FeatureContext::new(
                &dispatch.job_id,
                &dispatch.source,
                &dispatch.parameters,
                attempt,
                &dispatch.cancel,
            );
            let result = AssertUnwindSafe(dispatch.feature.execute(ctx))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(output)) => return ExecutionOutcome::Completed(output),
                Ok(Err(FeatureError::Canceled)) => return ExecutionOutcome::Canceled,
                Ok(Err(FeatureError::Fatal(message))) => {
                    return ExecutionOutcome::Failed(FailureReason::fatal(message));
                }
                Ok(Err(FeatureError::Transient(message))) => {
                    if attempt > dispatch.retry.max_retries {
                        return ExecutionOutcome::Failed(FailureReason::transient(format!(
                            "{message} (gave up after {attempt} attempts)"
                        )));
                    }
                    let delay = dispatch.retry.backoff.delay(attempt);
                    warn!(
                        worker_id = self.id,
                        job_id = %dispatch.job_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %message,
                        "transient feature failure, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = dispatch.cancel.cancelled() => return ExecutionOutcome::Canceled,
                    }
                    attempt += 1;
                }
                Err(_) => {
                    error!(worker_id = self.id, job_id = %dispatch.job_id, "feature panicked");
                    return ExecutionOutcome::Failed(FailureReason::fatal("feature panicked"));
                }
            }
        }
    }

    fn send(&self, event: WorkerEvent) {
        // The loop is gone during shutdown; nothing left to notify.
        let _ = self.events_tx.send(event);
    }
}
