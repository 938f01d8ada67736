//! Configuration models for the scheduler, backends, and timeouts.

pub mod scheduler;

pub use scheduler::{
    BackoffConfig, PersistencePolicy, RepositoryBackendConfig, SchedulerConfig, TimeoutPolicy,
};
