//! Tests for mailbox and diagnostics sink implementations

use deferred_media_scheduler::core::{
    DeferredVideoWork, DiagnosticsReport, DiagnosticsSink, FailureReason, InMemoryDiagnosticsSink,
    JobState, MediaBuffers, OutputMailbox, SchedulerError, TracingDiagnosticsSink,
};
use deferred_media_scheduler::infra::InMemoryOutputMailbox;
use deferred_media_scheduler::util::ids::{FeatureKind, JobId, Priority, SessionId};

fn job_id(session: &str) -> JobId {
    JobId::generate(SessionId::new(session))
}

#[test]
fn test_in_memory_mailbox_deliver_and_take() {
    let mailbox = InMemoryOutputMailbox::new();
    let mut writer = mailbox.clone();
    let a = job_id("session1");
    let b = job_id("session1");

    writer.deliver(&a, MediaBuffers::single("a.out", vec![1, 2])).unwrap();
    writer.deliver(&b, MediaBuffers::single("b.out", vec![3])).unwrap();
    assert_eq!(mailbox.len(), 2);

    assert_eq!(mailbox.take(&a).unwrap().references(), vec!["a.out".to_string()]);
    assert!(!mailbox.contains(&a));
    assert!(mailbox.contains(&b));
}

#[test]
fn test_in_memory_mailbox_rejects_second_delivery() {
    let mut mailbox = InMemoryOutputMailbox::new();
    let id = job_id("session2");
    mailbox.deliver(&id, MediaBuffers::single("out", vec![1])).unwrap();
    assert!(matches!(
        mailbox.deliver(&id, MediaBuffers::single("out", vec![2])),
        Err(SchedulerError::InvalidJob(_))
    ));
}

#[test]
fn test_diagnostics_state_path() {
    let sink = InMemoryDiagnosticsSink::new(16);
    let mut writer = sink.clone();
    let mut work = DeferredVideoWork::new(
        job_id("cam"),
        FeatureKind::new("noise_reduction"),
        Priority::NORMAL,
        vec!["raw".into()],
    );
    let id = work.id().clone();

    writer.report(&DiagnosticsReport::submitted(id.clone())).unwrap();
    let change = work.schedule().unwrap();
    writer.report(&DiagnosticsReport::transition(id.clone(), change, None)).unwrap();
    let change = work.cancel(FailureReason::canceled("user")).unwrap();
    let report = DiagnosticsReport::transition(id.clone(), change, work.failure().cloned());
    assert!(report.is_terminal());
    writer.report(&report).unwrap();

    assert_eq!(
        sink.state_path(&id),
        vec![JobState::Pending, JobState::Scheduled, JobState::Canceled]
    );
    let last = sink.reports_for(&id).pop().unwrap();
    assert_eq!(last.from, Some(JobState::Scheduled));
    assert!(last.failure_reason.is_some());
}

#[test]
fn test_tracing_sink_accepts_reports() {
    let mut sink = TracingDiagnosticsSink;
    assert!(sink.report(&DiagnosticsReport::submitted(job_id("cam"))).is_ok());
}
