//! Tests for builder modules

use std::time::Duration;

use deferred_media_scheduler::builders::{build_repository, SchedulerBuilder};
use deferred_media_scheduler::config::{RepositoryBackendConfig, SchedulerConfig};
use deferred_media_scheduler::core::{
    FailureKind, FeatureRegistry, JobRepository, JobRequest, JobState, MediaBuffers, MediaProxy,
    NoopMediaProxy, SchedulerError,
};
use deferred_media_scheduler::features::{moon_detail, DepthFusion};
use deferred_media_scheduler::infra::InMemoryOutputMailbox;
use deferred_media_scheduler::util::ids::{JobId, SessionId};

#[test]
fn test_builder_keeps_config() {
    let builder = SchedulerBuilder::new(SchedulerConfig::new().with_concurrency_budget(3));
    assert_eq!(builder.config().concurrency_budget, 3);
}

#[test]
fn test_builder_rejects_invalid_config() {
    let result = SchedulerBuilder::new(SchedulerConfig::new().with_max_queue_depth(0)).build();
    let err = result.err().expect("invalid config is rejected");
    assert!(format!("{err:#}").contains("max_queue_depth"));
}

#[test]
fn test_build_in_memory_repository() {
    let repo = build_repository(&RepositoryBackendConfig::InMemory).unwrap();
    assert!(repo.list_pending().unwrap().is_empty());
}

#[test]
fn test_build_file_repository() {
    let dir = std::env::temp_dir().join(format!("dms-unit-builder-{}", uuid::Uuid::new_v4()));
    let repo = build_repository(&RepositoryBackendConfig::File { path: dir.clone() }).unwrap();
    let stranger = JobId::generate(SessionId::new("x"));
    assert!(repo.get(&stranger).unwrap().is_none());
    assert!(dir.join("jobs.jsonl").exists());
    drop(repo);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn test_default_registry_runs_bundled_feature() {
    let mailbox = InMemoryOutputMailbox::new();
    let scheduler = SchedulerBuilder::new(
        SchedulerConfig::new()
            .with_concurrency_budget(1)
            .with_hard_timeout(Duration::from_secs(5)),
    )
    .with_mailbox(mailbox.clone())
    .build()
    .unwrap();

    let source = MediaBuffers::single("cam-0/moon", vec![100, 128, 200]);
    let id = scheduler
        .submit_job(JobRequest::new(SessionId::new("cam-0"), moon_detail::KIND, source))
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while scheduler.query_job(&id).unwrap() != Some(JobState::Completed) {
        assert!(std::time::Instant::now() < deadline, "job did not complete");
        std::thread::sleep(Duration::from_millis(5));
    }
    let output = mailbox.take(&id).unwrap();
    assert_eq!(output.buffers()[0].data[1], 128);
}

#[test]
fn test_noop_proxy_cannot_recover_buffers() {
    let id = JobId::generate(SessionId::new("cam-0"));
    let err = NoopMediaProxy.reacquire(&id, &["raw".into()]).unwrap_err();
    assert_eq!(err.kind, FailureKind::Fatal);
}

#[test]
fn test_builder_with_extra_feature_rejects_unknown_kind() {
    let scheduler = SchedulerBuilder::new(SchedulerConfig::new().with_concurrency_budget(1))
        .with_registry(FeatureRegistry::new())
        .with_feature(DepthFusion)
        .build()
        .unwrap();
    let source = MediaBuffers::single("cam-0/raw", vec![1]);
    let request = JobRequest::new(SessionId::new("cam-0"), "noise_reduction", source);
    let result = scheduler.submit_job(request);
    assert!(matches!(result, Err(SchedulerError::InvalidJob(_))));
}
