//! The deferred work entity and its state machine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::repository::JobRecord;
use crate::core::SchedulerError;
use crate::util::clock::{elapsed_since, now_ms};
use crate::util::ids::{FeatureKind, JobId, Priority, SessionId};

/// Free-form feature parameters attached to a job.
pub type JobParameters = serde_json::Map<String, serde_json::Value>;

/// Lifecycle state of a deferred job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, waiting in the queue.
    Pending,
    /// Claimed by the scheduler loop and handed to a worker.
    Scheduled,
    /// A feature is executing the job.
    Running,
    /// Output was produced.
    Completed,
    /// Execution failed.
    Failed,
    /// Canceled by request or forced by a timeout.
    Canceled,
}

impl JobState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether the state machine allows `self -> next` during normal execution.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Scheduled)
                | (Self::Scheduled, Self::Running)
                | (Self::Running, Self::Completed | Self::Failed)
                | (Self::Pending | Self::Scheduled | Self::Running, Self::Canceled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Category of a job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable error that kept failing until the retry budget ran out.
    Transient,
    /// Unrecoverable error, e.g. corrupted or invalidated source buffers.
    Fatal,
    /// The hard timeout elapsed.
    Timeout,
    /// Canceled by an external request.
    Canceled,
}

/// Why a job ended without output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

impl FailureReason {
    /// Create a reason.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Retries exhausted.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// Unrecoverable failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    /// Hard timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// External cancellation.
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Canceled, message)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// A state change applied to a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State before the change.
    pub from: JobState,
    /// State after the change.
    pub to: JobState,
    /// Time spent in `from`.
    pub elapsed: Duration,
}

/// One deferred enhancement task.
///
/// Terminal states are only reachable through [`complete`](Self::complete),
/// [`fail`](Self::fail) and [`cancel`](Self::cancel), which keeps exactly one
/// of result references or failure reason set once the job is terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredVideoWork {
    id: JobId,
    feature: FeatureKind,
    priority: Priority,
    parameters: JobParameters,
    source_references: Vec<String>,
    created_at_ms: u128,
    deadline_ms: Option<u128>,
    hard_timeout: Option<Duration>,
    submission_seq: u64,
    attempts: u32,
    state: JobState,
    state_changed_at_ms: u128,
    result_references: Option<Vec<String>>,
    failure: Option<FailureReason>,
}

impl DeferredVideoWork {
    /// Create a new pending job.
    #[must_use]
    pub fn new(
        id: JobId,
        feature: FeatureKind,
        priority: Priority,
        source_references: Vec<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id,
            feature,
            priority,
            parameters: JobParameters::new(),
            source_references,
            created_at_ms: now,
            deadline_ms: None,
            hard_timeout: None,
            submission_seq: 0,
            attempts: 0,
            state: JobState::Pending,
            state_changed_at_ms: now,
            result_references: None,
            failure: None,
        }
    }

    /// Attach feature parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: JobParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Hold the job until this wall-clock deadline.
    #[must_use]
    pub const fn with_deadline_ms(mut self, deadline_ms: Option<u128>) -> Self {
        self.deadline_ms = deadline_ms;
        self
    }

    /// Override the configured hard timeout.
    #[must_use]
    pub const fn with_hard_timeout(mut self, hard_timeout: Option<Duration>) -> Self {
        self.hard_timeout = hard_timeout;
        self
    }

    /// Submission order within this process.
    #[must_use]
    pub const fn with_submission_seq(mut self, seq: u64) -> Self {
        self.submission_seq = seq;
        self
    }

    /// Job identifier.
    #[must_use]
    pub const fn id(&self) -> &JobId {
        &self.id
    }

    /// Capture session of the job.
    #[must_use]
    pub const fn session(&self) -> &SessionId {
        &self.id.session
    }

    /// Feature selected at creation time.
    #[must_use]
    pub const fn feature(&self) -> &FeatureKind {
        &self.feature
    }

    /// Current priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Feature parameters.
    #[must_use]
    pub const fn parameters(&self) -> &JobParameters {
        &self.parameters
    }

    /// Persisted references to the source buffers.
    #[must_use]
    pub fn source_references(&self) -> &[String] {
        &self.source_references
    }

    /// Creation time, ms since epoch.
    #[must_use]
    pub const fn created_at_ms(&self) -> u128 {
        self.created_at_ms
    }

    /// Hold deadline, ms since epoch.
    #[must_use]
    pub const fn deadline_ms(&self) -> Option<u128> {
        self.deadline_ms
    }

    /// Per-job hard timeout override.
    #[must_use]
    pub const fn hard_timeout(&self) -> Option<Duration> {
        self.hard_timeout
    }

    /// Submission order within the process that created or recovered the job.
    #[must_use]
    pub const fn submission_seq(&self) -> u64 {
        self.submission_seq
    }

    /// Number of execution attempts started.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    /// Output references, set only once completed.
    #[must_use]
    pub fn result_references(&self) -> Option<&[String]> {
        self.result_references.as_deref()
    }

    /// Failure reason, set only once failed or canceled.
    #[must_use]
    pub const fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub(crate) fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub(crate) fn record_attempt(&mut self, attempt: u32) {
        self.attempts = self.attempts.max(attempt);
    }

    /// `Pending -> Scheduled`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::IllegalTransition`] from any other state.
    pub fn schedule(&mut self) -> Result<StateChange, SchedulerError> {
        self.advance(JobState::Scheduled)
    }

    /// `Scheduled -> Running`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::IllegalTransition`] from any other state.
    pub fn start(&mut self) -> Result<StateChange, SchedulerError> {
        self.advance(JobState::Running)
    }

    /// `Running -> Completed` with the produced output references.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::IllegalTransition`] from any other state.
    pub fn complete(&mut self, result_references: Vec<String>) -> Result<StateChange, SchedulerError> {
        let change = self.advance(JobState::Completed)?;
        self.result_references = Some(result_references);
        Ok(change)
    }

    /// `Running -> Failed`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::IllegalTransition`] from any other state.
    pub fn fail(&mut self, reason: FailureReason) -> Result<StateChange, SchedulerError> {
        let change = self.advance(JobState::Failed)?;
        self.failure = Some(reason);
        Ok(change)
    }

    /// Any non-terminal state `-> Canceled`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::IllegalTransition`] if already terminal.
    pub fn cancel(&mut self, reason: FailureReason) -> Result<StateChange, SchedulerError> {
        let change = self.advance(JobState::Canceled)?;
        self.failure = Some(reason);
        Ok(change)
    }

    /// Put in-flight work back to `Pending` after a process restart.
    ///
    /// Returns `None` if the job already was pending.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::IllegalTransition`] for terminal jobs.
    pub fn reset_for_recovery(&mut self) -> Result<Option<StateChange>, SchedulerError> {
        match self.state {
            JobState::Pending => Ok(None),
            JobState::Scheduled | JobState::Running => Ok(Some(self.apply(JobState::Pending))),
            from => Err(self.illegal(from, JobState::Pending)),
        }
    }

    fn advance(&mut self, to: JobState) -> Result<StateChange, SchedulerError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(self.illegal(from, to));
        }
        Ok(self.apply(to))
    }

    fn apply(&mut self, to: JobState) -> StateChange {
        let change = StateChange {
            from: self.state,
            to,
            elapsed: elapsed_since(self.state_changed_at_ms),
        };
        self.state = to;
        self.state_changed_at_ms = now_ms();
        change
    }

    fn illegal(&self, from: JobState, to: JobState) -> SchedulerError {
        tracing::error!(job_id = %self.id, %from, %to, "illegal job state transition");
        SchedulerError::IllegalTransition {
            job_id: self.id.clone(),
            from,
            to,
        }
    }

    /// Serializable metadata for the repository.
    #[must_use]
    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            job_id: self.id.clone(),
            feature_kind: self.feature.clone(),
            priority: self.priority,
            parameters: self.parameters.clone(),
            source_references: self.source_references.clone(),
            created_at_ms: self.created_at_ms,
            deadline_ms: self.deadline_ms,
            hard_timeout_ms: self
                .hard_timeout
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            submission_seq: self.submission_seq,
            attempts: self.attempts,
            state: self.state,
            state_changed_at_ms: self.state_changed_at_ms,
            failure_reason: self.failure.clone(),
            result_references: self.result_references.clone(),
        }
    }

    /// Rebuild a work item from its persisted metadata.
    #[must_use]
    pub fn from_record(record: JobRecord) -> Self {
        Self {
            id: record.job_id,
            feature: record.feature_kind,
            priority: record.priority,
            parameters: record.parameters,
            source_references: record.source_references,
            created_at_ms: record.created_at_ms,
            deadline_ms: record.deadline_ms,
            hard_timeout: record.hard_timeout_ms.map(Duration::from_millis),
            submission_seq: record.submission_seq,
            attempts: record.attempts,
            state: record.state,
            state_changed_at_ms: record.state_changed_at_ms,
            result_references: record.result_references,
            failure: record.failure_reason,
        }
    }
}
