//! Diagnostics sink implementations.
//!
//! Every state transition is reported here after the repository has recorded
//! it. Delivery is fire-and-forget: a failing sink is logged and never affects
//! the job.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::job::{FailureReason, JobState, StateChange};
use crate::core::SchedulerError;
use crate::util::clock::now_ms;
use crate::util::ids::JobId;

/// One reported state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsReport {
    /// Job that changed state.
    pub job_id: JobId,
    /// Previous state, `None` for a fresh submission.
    pub from: Option<JobState>,
    /// New state.
    pub to: JobState,
    /// Timestamp milliseconds.
    pub timestamp_ms: u128,
    /// Time spent in the previous state.
    pub duration: Option<Duration>,
    /// Failure reason for failed or canceled jobs.
    pub failure_reason: Option<FailureReason>,
    /// Whether the job was requeued from the repository after a restart.
    pub recovered: bool,
}

impl DiagnosticsReport {
    /// Report for a newly submitted job.
    #[must_use]
    pub fn submitted(job_id: JobId) -> Self {
        Self {
            job_id,
            from: None,
            to: JobState::Pending,
            timestamp_ms: now_ms(),
            duration: None,
            failure_reason: None,
            recovered: false,
        }
    }

    /// Report for a job requeued after a restart.
    ///
    /// `reset` is the `Scheduled`/`Running` to `Pending` change when the
    /// record was in flight; a record that was already pending reports
    /// `Pending` to `Pending`.
    #[must_use]
    pub fn recovered(job_id: JobId, reset: Option<StateChange>) -> Self {
        let (from, duration) = match reset {
            Some(change) => (change.from, Some(change.elapsed)),
            None => (JobState::Pending, None),
        };
        Self {
            job_id,
            from: Some(from),
            to: JobState::Pending,
            timestamp_ms: now_ms(),
            duration,
            failure_reason: None,
            recovered: true,
        }
    }

    /// Report for an applied state change.
    #[must_use]
    pub fn transition(
        job_id: JobId,
        change: StateChange,
        failure_reason: Option<FailureReason>,
    ) -> Self {
        Self {
            job_id,
            from: Some(change.from),
            to: change.to,
            timestamp_ms: now_ms(),
            duration: Some(change.elapsed),
            failure_reason,
            recovered: false,
        }
    }

    /// Whether the report records a terminal transition.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}

/// Diagnostics sink abstraction.
pub trait DiagnosticsSink: Send {
    /// Record a transition.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the scheduler logs and ignores the error.
    fn report(&mut self, report: &DiagnosticsReport) -> Result<(), SchedulerError>;
}

/// In-memory sink for testing and dev. Clones share the same buffer.
#[derive(Clone)]
pub struct InMemoryDiagnosticsSink {
    reports: Arc<Mutex<VecDeque<DiagnosticsReport>>>,
    max_reports: usize,
}

impl InMemoryDiagnosticsSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_reports: usize) -> Self {
        Self {
            reports: Arc::new(Mutex::new(VecDeque::with_capacity(max_reports.min(1024)))),
            max_reports,
        }
    }

    /// Retrieve a snapshot of stored reports.
    #[must_use]
    pub fn reports(&self) -> Vec<DiagnosticsReport> {
        self.reports.lock().iter().cloned().collect()
    }

    /// Reports for one job, in delivery order.
    #[must_use]
    pub fn reports_for(&self, job_id: &JobId) -> Vec<DiagnosticsReport> {
        self.reports
            .lock()
            .iter()
            .filter(|r| &r.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Observed state sequence for one job, starting with `Pending`.
    #[must_use]
    pub fn state_path(&self, job_id: &JobId) -> Vec<JobState> {
        self.reports_for(job_id).iter().map(|r| r.to).collect()
    }
}

impl DiagnosticsSink for InMemoryDiagnosticsSink {
    fn report(&mut self, report: &DiagnosticsReport) -> Result<(), SchedulerError> {
        let mut reports = self.reports.lock();
        if reports.len() >= self.max_reports {
            reports.pop_front();
        }
        reports.push_back(report.clone());
        Ok(())
    }
}

/// Sink that emits each report as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnosticsSink;

impl DiagnosticsSink for TracingDiagnosticsSink {
    fn report(&mut self, report: &DiagnosticsReport) -> Result<(), SchedulerError> {
        let from = report.from.map_or_else(|| "-".to_string(), |s| s.to_string());
        let duration_ms = report.duration.map(|d| d.as_millis());
        match &report.failure_reason {
            Some(reason) => tracing::info!(
                target: "deferred_media_scheduler::diagnostics",
                job_id = %report.job_id,
                from = %from,
                to = %report.to,
                duration_ms = ?duration_ms,
                reason = %reason,
                recovered = report.recovered,
                "job transition"
            ),
            None => tracing::info!(
                target: "deferred_media_scheduler::diagnostics",
                job_id = %report.job_id,
                from = %from,
                to = %report.to,
                duration_ms = ?duration_ms,
                recovered = report.recovered,
                "job transition"
            ),
        }
        Ok(())
    }
}
