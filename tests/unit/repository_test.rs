//! Tests for repository implementations

use std::fs;

use deferred_media_scheduler::core::{
    DeferredVideoWork, FailureReason, JobRepository, JobState, SchedulerError,
};
use deferred_media_scheduler::infra::{FileJobRepository, InMemoryJobRepository};
use deferred_media_scheduler::util::ids::{FeatureKind, JobId, Priority, SessionId};

fn work(session: &str) -> DeferredVideoWork {
    DeferredVideoWork::new(
        JobId::generate(SessionId::new(session)),
        FeatureKind::new("moon_detail_boost"),
        Priority::NORMAL,
        vec![format!("{session}/raw-0")],
    )
}

fn exercise(repo: &mut dyn JobRepository) {
    let mut running = work("a");
    running.schedule().unwrap();
    running.start().unwrap();
    let mut failed = work("b");
    failed.cancel(FailureReason::canceled("user")).unwrap();
    let pending = work("c");

    for job in [&running, &failed, &pending] {
        repo.upsert(&job.to_record()).unwrap();
    }

    let mut ids: Vec<JobId> = repo
        .list_pending()
        .unwrap()
        .into_iter()
        .map(|r| r.job_id)
        .collect();
    ids.sort();
    let mut expected = vec![running.id().clone(), pending.id().clone()];
    expected.sort();
    assert_eq!(ids, expected);

    let stored = repo.get(failed.id()).unwrap().unwrap();
    assert_eq!(stored.state, JobState::Canceled);
    assert_eq!(stored.failure_reason.unwrap().message, "user");

    assert!(repo.remove(failed.id()).unwrap());
    assert!(repo.get(failed.id()).unwrap().is_none());
    assert!(!repo.remove(failed.id()).unwrap());
}

#[test]
fn test_in_memory_repository_contract() {
    let mut repo = InMemoryJobRepository::new();
    exercise(&mut repo);
    assert_eq!(repo.len(), 2);
}

#[test]
fn test_file_repository_contract() {
    let dir = std::env::temp_dir().join(format!("dms-unit-repo-{}", uuid::Uuid::new_v4()));
    let mut repo = FileJobRepository::open(&dir).unwrap();
    exercise(&mut repo);
    assert_eq!(repo.len(), 2);
    assert_eq!(repo.dir(), dir.as_path());
    drop(repo);
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn test_in_memory_injected_failures() {
    let repo = InMemoryJobRepository::new();
    let mut writer = repo.clone();
    let job = work("a");

    repo.fail_next_writes(1);
    assert!(matches!(
        writer.upsert(&job.to_record()),
        Err(SchedulerError::Repository(_))
    ));
    assert!(repo.is_empty());

    writer.upsert(&job.to_record()).unwrap();
    assert_eq!(repo.record(job.id()).unwrap().state, JobState::Pending);
    assert_eq!(repo.write_count(), 1);
}

#[test]
fn test_record_serializes_as_json() {
    let mut job = work("a").with_deadline_ms(Some(1_700_000_000_000));
    job.schedule().unwrap();
    let record = job.to_record();
    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["state"], "scheduled");
    assert_eq!(json["feature_kind"], "moon_detail_boost");
    assert_eq!(json["source_references"][0], "a/raw-0");
}
