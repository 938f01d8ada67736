//! Tests for utility functions

use std::time::{Duration, Instant};

use deferred_media_scheduler::util::clock::{elapsed_since, instant_from_wall_clock, now_ms};
use deferred_media_scheduler::util::ids::{FeatureKind, JobId, Priority, SessionId};
use deferred_media_scheduler::util::telemetry::init_tracing;

#[test]
fn test_priority_ordering() {
    assert!(Priority::CRITICAL > Priority::HIGH);
    assert!(Priority::HIGH > Priority::NORMAL);
    assert!(Priority::NORMAL > Priority::LOW);
    assert!(Priority(200) > Priority::CRITICAL);
}

#[test]
fn test_job_id_keeps_session() {
    let id = JobId::generate(SessionId::new("cam-3"));
    assert_eq!(id.session.as_str(), "cam-3");
    assert!(id.to_string().starts_with("cam-3/"));
}

#[test]
fn test_job_id_serde() {
    let id = JobId::generate(SessionId::new("cam-3"));
    let json = serde_json::to_string(&id).unwrap();
    let back: JobId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn test_feature_kind_from_str() {
    let kind: FeatureKind = "depth_fusion".into();
    assert_eq!(kind, FeatureKind::new("depth_fusion"));
    assert_eq!(kind.to_string(), "depth_fusion");
}

#[test]
fn test_wall_clock_deadline_conversion() {
    let before = Instant::now();
    let deadline = instant_from_wall_clock(now_ms() + 500);
    assert!(deadline > before + Duration::from_millis(400));
    assert!(instant_from_wall_clock(0) <= Instant::now());
}

#[test]
fn test_elapsed_since_future_is_zero() {
    assert_eq!(elapsed_since(now_ms() + 10_000), Duration::ZERO);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
    tracing::info!("tracing initialised twice");
}
