//! # Deferred Media Scheduler
//!
//! Runs expensive post-capture enhancement work (detail boost, depth fusion,
//! noise reduction) after the capture itself has finished, subject to timing,
//! ordering and resource constraints.
//!
//! ## Key Features
//!
//! - **Priority queue with session FIFO**: higher priority first, submission
//!   order among equals, deferred jobs held until their release deadline
//! - **Bounded execution**: a fixed concurrency budget of dedicated worker
//!   threads, each with its own single-threaded tokio runtime
//! - **Durable job tracking**: every state change is persisted before it is
//!   reported; non-terminal jobs are recovered after a restart
//! - **Timers**: release deadlines, hard timeouts and cancel grace periods on
//!   one delivery thread with generation-based invalidation
//! - **Cooperative cancellation**: features checkpoint a cancellation token;
//!   features that ignore it are force-canceled at their deadline
//!
//! ```rust,ignore
//! use deferred_media_scheduler::builders::SchedulerBuilder;
//! use deferred_media_scheduler::config::SchedulerConfig;
//! use deferred_media_scheduler::core::{JobRequest, MediaBuffers};
//! use deferred_media_scheduler::util::ids::{Priority, SessionId};
//!
//! let scheduler = SchedulerBuilder::new(SchedulerConfig::new().with_concurrency_budget(2))
//!     .build()?;
//! let job_id = scheduler.submit_job(
//!     JobRequest::new(SessionId::new("cam-0"), "noise_reduction", raw_frames)
//!         .with_priority(Priority::HIGH),
//! )?;
//! let state = scheduler.query_job(&job_id)?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions: jobs, queue, timers, features and the loop.
pub mod core;
/// Configuration models for the scheduler, backends, and timeouts.
pub mod config;
/// Builders to construct a scheduler from configuration.
pub mod builders;
/// Bundled reference features.
pub mod features;
/// Infrastructure adapters for repositories, mailboxes, and the media proxy.
pub mod infra;
/// Shared utilities.
pub mod util;
