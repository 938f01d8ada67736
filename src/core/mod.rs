//! Core scheduling abstractions: jobs, queue, timers, features and the loop.

pub mod buffers;
pub mod diagnostics;
pub mod error;
pub mod feature;
pub mod job;
pub mod mailbox;
pub mod queue;
pub mod repository;
pub mod scheduler;
pub mod timer;
pub mod worker_pool;

pub use buffers::{BufferArena, MediaBuffer, MediaBuffers, MediaProxy, NoopMediaProxy};
pub use diagnostics::{
    DiagnosticsReport, DiagnosticsSink, InMemoryDiagnosticsSink, TracingDiagnosticsSink,
};
pub use error::{AppResult, SchedulerError};
pub use feature::{Feature, FeatureContext, FeatureError, FeatureRegistry};
pub use job::{
    DeferredVideoWork, FailureKind, FailureReason, JobParameters, JobState, StateChange,
};
pub use mailbox::OutputMailbox;
pub use queue::VideoJobQueue;
pub use repository::{JobRecord, JobRepository};
pub use scheduler::{JobRequest, Scheduler, SchedulerStats};
pub use timer::{TimerCore, TimerEvent, TimerHandle, TimerKind};
pub use worker_pool::{Dispatch, ExecutionOutcome, RetryPolicy, WorkerEvent, WorkerId, WorkerPool};
