//! Assemble a [`Scheduler`] from configuration and collaborators.

use std::sync::Arc;

use anyhow::{anyhow, Context};

use crate::config::{RepositoryBackendConfig, SchedulerConfig};
use crate::core::{
    AppResult, DiagnosticsSink, Feature, FeatureRegistry, JobRepository, MediaProxy,
    NoopMediaProxy, OutputMailbox, Scheduler, TracingDiagnosticsSink,
};
use crate::features::default_registry;
use crate::infra::{FileJobRepository, InMemoryJobRepository, InMemoryOutputMailbox};

/// Build the repository selected by `cfg`.
///
/// # Errors
///
/// The file backend could not be opened.
pub fn build_repository(cfg: &RepositoryBackendConfig) -> AppResult<Box<dyn JobRepository>> {
    match cfg {
        RepositoryBackendConfig::InMemory => Ok(Box::new(InMemoryJobRepository::new())),
        RepositoryBackendConfig::File { path } => {
            let repo = FileJobRepository::open(path)
                .with_context(|| format!("failed to open job repository at {}", path.display()))?;
            Ok(Box::new(repo))
        }
    }
}

/// Fluent builder for [`Scheduler`].
///
/// Defaults: the bundled features, the repository named by the config, a
/// media proxy that cannot reacquire buffers, a tracing diagnostics sink and
/// an in-memory output mailbox.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    registry: FeatureRegistry,
    repository: Option<Box<dyn JobRepository>>,
    proxy: Arc<dyn MediaProxy>,
    diagnostics: Box<dyn DiagnosticsSink>,
    mailbox: Box<dyn OutputMailbox>,
}

impl SchedulerBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            registry: default_registry(),
            repository: None,
            proxy: Arc::new(NoopMediaProxy),
            diagnostics: Box::new(TracingDiagnosticsSink),
            mailbox: Box::new(InMemoryOutputMailbox::new()),
        }
    }

    /// Start from `DEFERRED_SCHEDULER_*` environment variables.
    ///
    /// # Errors
    ///
    /// Invalid environment configuration.
    pub fn from_env() -> AppResult<Self> {
        let config = SchedulerConfig::from_env()
            .map_err(|e| anyhow!(e))
            .context("invalid scheduler configuration in environment")?;
        Ok(Self::new(config))
    }

    /// Replace the feature registry.
    #[must_use]
    pub fn with_registry(mut self, registry: FeatureRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register one more feature.
    #[must_use]
    pub fn with_feature(mut self, feature: impl Feature) -> Self {
        self.registry.register(Arc::new(feature));
        self
    }

    /// Use this repository instead of the configured backend.
    #[must_use]
    pub fn with_repository(mut self, repository: impl JobRepository + 'static) -> Self {
        self.repository = Some(Box::new(repository));
        self
    }

    /// Set the media proxy.
    #[must_use]
    pub fn with_proxy(mut self, proxy: Arc<dyn MediaProxy>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Set the diagnostics sink.
    #[must_use]
    pub fn with_diagnostics(mut self, sink: impl DiagnosticsSink + 'static) -> Self {
        self.diagnostics = Box::new(sink);
        self
    }

    /// Set the output mailbox.
    #[must_use]
    pub fn with_mailbox(mut self, mailbox: impl OutputMailbox + 'static) -> Self {
        self.mailbox = Box::new(mailbox);
        self
    }

    /// Configuration the scheduler will start with.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Recover persisted work and start the scheduler.
    ///
    /// # Errors
    ///
    /// Invalid configuration, repository open or recovery failure.
    pub fn build(self) -> AppResult<Scheduler> {
        self.config
            .validate()
            .map_err(|e| anyhow!(e))
            .context("invalid scheduler configuration")?;
        let repository = match self.repository {
            Some(repository) => repository,
            None => build_repository(&self.config.repository)?,
        };
        let budget = self.config.concurrency_budget;
        let scheduler = Scheduler::start(
            self.config,
            self.registry,
            repository,
            self.proxy,
            self.diagnostics,
            self.mailbox,
        )
        .context("failed to start scheduler")?;
        tracing::info!(budget, "scheduler started");
        Ok(scheduler)
    }
}
