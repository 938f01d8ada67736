//! Restart recovery: a second scheduler over the same repository picks up
//! whatever the first one left unfinished.

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{wait_for_state, Gated, HarnessBuilder, Recording};
use deferred_media_scheduler::builders::SchedulerBuilder;
use deferred_media_scheduler::config::RepositoryBackendConfig;
use deferred_media_scheduler::core::{
    FailureKind, FeatureRegistry, JobRepository, JobRequest, JobState, MediaBuffers,
};
use deferred_media_scheduler::infra::{FileJobRepository, InMemoryJobRepository, InMemoryMediaProxy};
use deferred_media_scheduler::util::ids::{JobId, Priority, SessionId};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn pending_jobs_resume_in_submission_order() {
    let repository = InMemoryJobRepository::new();
    let proxy = InMemoryMediaProxy::new();

    let mut first = HarnessBuilder::new(1)
        .repository(repository.clone())
        .proxy(proxy.clone())
        .start();
    first.scheduler.pause_dispatch().unwrap();
    let ids: Vec<JobId> = (0..3)
        .map(|i| first.submit(&format!("cam-{i}"), Recording::KIND, Priority::NORMAL))
        .collect();
    first.scheduler.shutdown().unwrap();
    assert_eq!(repository.len(), 3);

    let second = HarnessBuilder::new(1)
        .repository(repository.clone())
        .proxy(proxy.clone())
        .start();
    // Submitted after recovery, so it sorts behind every recovered job.
    let late = second.submit("cam-0", Recording::KIND, Priority::NORMAL);

    for id in ids.iter().chain([&late]) {
        assert!(second.wait_for(id, JobState::Completed));
    }
    let mut expected = ids.clone();
    expected.push(late.clone());
    assert_eq!(second.recording.order(), expected);
    assert_eq!(
        second.diagnostics.state_path(&ids[0]),
        vec![
            JobState::Pending,
            JobState::Scheduled,
            JobState::Running,
            JobState::Completed
        ]
    );
    let recovered = &second.diagnostics.reports_for(&ids[0])[0];
    assert!(recovered.recovered);
    assert_eq!(recovered.from, Some(JobState::Pending));
    assert!(!second.diagnostics.reports_for(&late)[0].recovered);
}

#[test]
fn running_record_is_reset_and_rerun() {
    let repository = InMemoryJobRepository::new();
    let proxy = InMemoryMediaProxy::new();

    let mut first = HarnessBuilder::new(1)
        .repository(repository.clone())
        .proxy(proxy.clone())
        .start();
    let id = first.submit("cam-0", Gated::KIND, Priority::HIGH);
    assert!(first.wait_for(&id, JobState::Running));
    first.scheduler.shutdown().unwrap();
    assert_eq!(repository.record(&id).unwrap().state, JobState::Running);
    assert!(!proxy.was_released(&id));

    let second = HarnessBuilder::new(1)
        .repository(repository.clone())
        .proxy(proxy.clone())
        .start();
    assert!(second.wait_for(&id, JobState::Running));
    second.gated.open();
    assert!(second.wait_for(&id, JobState::Completed));

    // The restart reports the reset itself, not a fresh submission.
    let first_report = second.diagnostics.reports_for(&id).remove(0);
    assert!(first_report.recovered);
    assert_eq!(first_report.from, Some(JobState::Running));
    assert_eq!(first_report.to, JobState::Pending);

    let record = repository.record(&id).unwrap();
    assert_eq!(record.priority, Priority::HIGH);
    assert!(record.result_references.is_some());
    assert!(proxy.was_released(&id));
}

#[test]
fn terminal_jobs_are_not_requeued() {
    let repository = InMemoryJobRepository::new();
    let proxy = InMemoryMediaProxy::new();

    let mut first = HarnessBuilder::new(1)
        .repository(repository.clone())
        .proxy(proxy.clone())
        .start();
    let done = first.submit("cam-0", Recording::KIND, Priority::NORMAL);
    assert!(first.wait_for(&done, JobState::Completed));
    first.scheduler.pause_dispatch().unwrap();
    let canceled = first.submit("cam-0", Recording::KIND, Priority::NORMAL);
    first.scheduler.cancel_job(&canceled).unwrap();
    first.scheduler.shutdown().unwrap();

    let second = HarnessBuilder::new(1)
        .repository(repository.clone())
        .proxy(proxy)
        .start();
    let stats = second.scheduler.stats().unwrap();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.in_flight, 0);
    assert!(second.recording.order().is_empty());
    assert_eq!(second.scheduler.query_job(&done).unwrap(), Some(JobState::Completed));
    assert_eq!(second.scheduler.query_job(&canceled).unwrap(), Some(JobState::Canceled));
}

#[test]
fn lost_buffers_cancel_the_recovered_job() {
    let repository = InMemoryJobRepository::new();
    let proxy = InMemoryMediaProxy::new();

    let mut first = HarnessBuilder::new(1)
        .repository(repository.clone())
        .proxy(proxy.clone())
        .start();
    first.scheduler.pause_dispatch().unwrap();
    let request = first.request("cam-0", Recording::KIND);
    let reference = request.source.references()[0].clone();
    let lost = first.submit_request(request);
    let kept = first.submit("cam-0", Recording::KIND, Priority::NORMAL);
    first.scheduler.shutdown().unwrap();

    assert!(proxy.invalidate(&reference));

    let second = HarnessBuilder::new(1)
        .repository(repository.clone())
        .proxy(proxy)
        .start();
    assert_eq!(second.scheduler.query_job(&lost).unwrap(), Some(JobState::Canceled));
    let record = repository.record(&lost).unwrap();
    assert_eq!(record.failure_reason.unwrap().kind, FailureKind::Fatal);

    assert!(second.wait_for(&kept, JobState::Completed));
    assert_eq!(second.recording.order(), vec![kept]);
}

fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("dms-recovery-{name}-{}", uuid::Uuid::new_v4()))
}

fn file_scheduler(
    dir: &Path,
    recording: &Recording,
    proxy: &InMemoryMediaProxy,
) -> deferred_media_scheduler::core::Scheduler {
    let config = common::test_config(1).with_repository(RepositoryBackendConfig::File {
        path: dir.to_path_buf(),
    });
    SchedulerBuilder::new(config)
        .with_registry(FeatureRegistry::new().with_feature(recording.clone()))
        .with_proxy(Arc::new(proxy.clone()))
        .build()
        .unwrap()
}

#[test]
fn file_repository_survives_restart() {
    let dir = temp_dir("file");
    let proxy = InMemoryMediaProxy::new();

    let first_run = Recording::default();
    let mut scheduler = file_scheduler(&dir, &first_run, &proxy);
    scheduler.pause_dispatch().unwrap();
    let ids: Vec<JobId> = (0..2)
        .map(|i| {
            let source = MediaBuffers::single(format!("raw-{i}"), vec![i; 16]);
            proxy.store(&source);
            scheduler
                .submit_job(JobRequest::new(SessionId::new("cam-0"), Recording::KIND, source))
                .unwrap()
        })
        .collect();
    scheduler.shutdown().unwrap();
    assert!(first_run.order().is_empty());

    let second_run = Recording::default();
    let mut scheduler = file_scheduler(&dir, &second_run, &proxy);
    for id in &ids {
        assert!(wait_for_state(&scheduler, id, JobState::Completed, WAIT));
    }
    scheduler.shutdown().unwrap();
    assert_eq!(second_run.order(), ids);

    let reopened = FileJobRepository::open(&dir).unwrap();
    assert!(reopened.list_pending().unwrap().is_empty());
    for id in &ids {
        assert_eq!(reopened.get(id).unwrap().unwrap().state, JobState::Completed);
    }
    let _ = fs::remove_dir_all(dir);
}
