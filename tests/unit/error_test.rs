//! Tests for error types

use deferred_media_scheduler::core::{JobState, SchedulerError};
use deferred_media_scheduler::util::ids::{JobId, SessionId};

#[test]
fn test_queue_full_error() {
    let err = SchedulerError::QueueFull("max queue depth 2 reached".to_string());
    assert_eq!(format!("{err}"), "queue full: max queue depth 2 reached");
}

#[test]
fn test_invalid_job_error() {
    let err = SchedulerError::InvalidJob("job has no source buffers".to_string());
    assert_eq!(format!("{err}"), "invalid job: job has no source buffers");
}

#[test]
fn test_unknown_job_error_names_job() {
    let id = JobId::generate(SessionId::new("cam-0"));
    let err = SchedulerError::UnknownJob(id.clone());
    assert_eq!(format!("{err}"), format!("unknown job: {id}"));
}

#[test]
fn test_illegal_transition_error() {
    let id = JobId::generate(SessionId::new("cam-0"));
    let err = SchedulerError::IllegalTransition {
        job_id: id,
        from: JobState::Completed,
        to: JobState::Running,
    };
    assert!(format!("{err}").contains("Completed -> Running"));
}

#[test]
fn test_shutdown_error() {
    assert_eq!(
        format!("{}", SchedulerError::Shutdown),
        "scheduler has been shut down"
    );
}

#[test]
fn test_backend_error() {
    let err = SchedulerError::Backend("connection failed".to_string());
    assert_eq!(format!("{err}"), "backend error: connection failed");
}

#[test]
fn test_error_converts_to_anyhow() {
    let err: anyhow::Error = SchedulerError::Repository("disk full".into()).into();
    assert_eq!(err.to_string(), "repository error: disk full");
    assert!(err.downcast_ref::<SchedulerError>().is_some());
}
