//! Tests for the pending-work queue

use deferred_media_scheduler::core::{DeferredVideoWork, SchedulerError, VideoJobQueue};
use deferred_media_scheduler::util::ids::{FeatureKind, JobId, Priority, SessionId};

fn work(session: &str, priority: Priority) -> DeferredVideoWork {
    DeferredVideoWork::new(
        JobId::generate(SessionId::new(session)),
        FeatureKind::new("noise_reduction"),
        priority,
        vec![format!("{session}/raw")],
    )
}

fn push(queue: &mut VideoJobQueue, session: &str, priority: Priority, held: bool) -> JobId {
    let work = work(session, priority);
    let id = work.id().clone();
    queue.push(work, held).unwrap();
    id
}

#[test]
fn test_releasing_hold_unblocks_session_lane() {
    let mut queue = VideoJobQueue::new(8);
    let deferred = push(&mut queue, "cam-0", Priority::NORMAL, true);
    let follower = push(&mut queue, "cam-0", Priority::NORMAL, false);
    let other = push(&mut queue, "cam-1", Priority::NORMAL, false);

    assert_eq!(queue.pop_ready().unwrap().id(), &other);
    assert!(queue.pop_ready().is_none());
    assert_eq!(queue.held_len(), 1);

    assert!(queue.release_hold(&deferred));
    assert!(!queue.release_hold(&deferred));
    assert_eq!(queue.pop_ready().unwrap().id(), &deferred);
    assert_eq!(queue.pop_ready().unwrap().id(), &follower);
    assert!(queue.is_empty());
}

#[test]
fn test_higher_priority_in_same_session_is_not_blocked() {
    let mut queue = VideoJobQueue::new(8);
    push(&mut queue, "cam-0", Priority::NORMAL, true);
    let urgent = push(&mut queue, "cam-0", Priority::CRITICAL, false);
    assert_eq!(queue.pop_ready().unwrap().id(), &urgent);
}

#[test]
fn test_job_ids_follow_dispatch_order() {
    let mut queue = VideoJobQueue::new(8);
    let low = push(&mut queue, "a", Priority::LOW, false);
    let high = push(&mut queue, "b", Priority::HIGH, false);
    let normal = push(&mut queue, "c", Priority::NORMAL, false);
    assert_eq!(queue.job_ids(), vec![high, normal, low]);
}

#[test]
fn test_reorder_updates_work_priority() {
    let mut queue = VideoJobQueue::new(8);
    let id = push(&mut queue, "a", Priority::LOW, false);
    assert!(queue.reorder_on_priority_change(&id, Priority::CRITICAL));
    assert_eq!(queue.get(&id).unwrap().priority(), Priority::CRITICAL);
    let stranger = JobId::generate(SessionId::new("z"));
    assert!(!queue.reorder_on_priority_change(&stranger, Priority::LOW));
}

#[test]
fn test_capacity_frees_after_pop() {
    let mut queue = VideoJobQueue::new(1);
    push(&mut queue, "a", Priority::NORMAL, false);
    assert!(matches!(
        queue.push(work("a", Priority::NORMAL), false),
        Err(SchedulerError::QueueFull(_))
    ));
    queue.pop_ready().unwrap();
    assert!(queue.push(work("a", Priority::NORMAL), false).is_ok());
    assert_eq!(queue.max_depth(), 1);
}
