//! Tests for configuration validation

use std::path::PathBuf;
use std::time::Duration;

use deferred_media_scheduler::config::{
    BackoffConfig, PersistencePolicy, RepositoryBackendConfig, SchedulerConfig, TimeoutPolicy,
};

#[test]
fn test_default_config_values() {
    let cfg = SchedulerConfig::default();
    assert!((1..=4).contains(&cfg.concurrency_budget));
    assert_eq!(cfg.max_queue_depth, 256);
    assert_eq!(cfg.hard_timeout(), Duration::from_secs(300));
    assert_eq!(cfg.cancel_grace(), Duration::from_secs(2));
    assert_eq!(cfg.persistence, PersistencePolicy::Durable);
    assert_eq!(cfg.timeout_policy, TimeoutPolicy::SpanRetries);
    assert_eq!(cfg.repository, RepositoryBackendConfig::InMemory);
}

#[test]
fn test_config_invalid_budget() {
    let cfg = SchedulerConfig::new().with_concurrency_budget(0);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_config_invalid_queue_depth() {
    let cfg = SchedulerConfig::new().with_max_queue_depth(0);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_config_invalid_timeout() {
    let cfg = SchedulerConfig::new().with_hard_timeout(Duration::ZERO);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_config_invalid_stack_size() {
    let cfg = SchedulerConfig::new().with_thread_stack_size(1024);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_config_empty_repository_path() {
    let cfg = SchedulerConfig::new().with_repository(RepositoryBackendConfig::File {
        path: PathBuf::new(),
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_config_from_json_partial() {
    let json = r#"{
        "concurrency_budget": 2,
        "hard_timeout_ms": 1500,
        "persistence": "best_effort",
        "timeout_policy": "per_attempt",
        "repository": { "file": { "path": "/var/lib/dms" } }
    }"#;
    let cfg = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.concurrency_budget, 2);
    assert_eq!(cfg.hard_timeout(), Duration::from_millis(1500));
    assert_eq!(cfg.persistence, PersistencePolicy::BestEffort);
    assert_eq!(cfg.timeout_policy, TimeoutPolicy::PerAttempt);
    assert_eq!(
        cfg.repository,
        RepositoryBackendConfig::File {
            path: PathBuf::from("/var/lib/dms")
        }
    );
    // Unset fields keep their defaults.
    assert_eq!(cfg.max_queue_depth, 256);
}

#[test]
fn test_config_from_json_rejects_invalid_values() {
    assert!(SchedulerConfig::from_json_str(r#"{"max_queue_depth": 0}"#).is_err());
    assert!(SchedulerConfig::from_json_str("not json").is_err());
}

#[test]
fn test_config_json_round_trip() {
    let cfg = SchedulerConfig::new()
        .with_concurrency_budget(3)
        .with_repository_backoff(BackoffConfig::new(10, 80));
    let json = serde_json::to_string(&cfg).unwrap();
    let parsed = SchedulerConfig::from_json_str(&json).unwrap();
    assert_eq!(parsed.concurrency_budget, 3);
    assert_eq!(parsed.repository_backoff, BackoffConfig::new(10, 80));
}

#[test]
fn test_backoff_first_delay_is_base() {
    let backoff = BackoffConfig::new(25, 1000);
    assert_eq!(backoff.delay(0), Duration::from_millis(25));
    assert_eq!(backoff.delay(1), Duration::from_millis(25));
    assert_eq!(backoff.delay(4), Duration::from_millis(200));
}
