//! Test features and a scheduler harness shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use deferred_media_scheduler::builders::SchedulerBuilder;
use deferred_media_scheduler::config::{BackoffConfig, SchedulerConfig};
use deferred_media_scheduler::core::{
    Feature, FeatureContext, FeatureError, FeatureRegistry, InMemoryDiagnosticsSink, JobRequest,
    JobState, MediaBuffers, Scheduler,
};
use deferred_media_scheduler::infra::{InMemoryJobRepository, InMemoryMediaProxy, InMemoryOutputMailbox};
use deferred_media_scheduler::util::ids::{FeatureKind, JobId, Priority, SessionId};
use deferred_media_scheduler::util::telemetry::DEFAULT_FILTER;
use tracing_subscriber::EnvFilter;

/// Route scheduler logs through the test harness's captured output.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// TEST FEATURES
// ============================================================================

/// Copies its source and records the order in which jobs ran.
#[derive(Clone, Default)]
pub struct Recording {
    pub order: Arc<Mutex<Vec<JobId>>>,
}

impl Recording {
    pub const KIND: &'static str = "record";

    pub fn order(&self) -> Vec<JobId> {
        self.order.lock().clone()
    }
}

#[async_trait]
impl Feature for Recording {
    fn kind(&self) -> FeatureKind {
        FeatureKind::new(Self::KIND)
    }

    async fn execute(&self, ctx: FeatureContext<'_>) -> Result<MediaBuffers, FeatureError> {
        ctx.checkpoint()?;
        self.order.lock().push(ctx.job_id().clone());
        Ok(ctx.source().clone())
    }
}

/// Blocks its worker thread and never looks at the cancellation token.
#[derive(Clone)]
pub struct Stubborn {
    pub block_for: Duration,
}

impl Stubborn {
    pub const KIND: &'static str = "stubborn";
}

#[async_trait]
impl Feature for Stubborn {
    fn kind(&self) -> FeatureKind {
        FeatureKind::new(Self::KIND)
    }

    async fn execute(&self, ctx: FeatureContext<'_>) -> Result<MediaBuffers, FeatureError> {
        thread::sleep(self.block_for);
        Ok(ctx.source().clone())
    }
}

/// Waits until the gate opens or cancellation is requested.
#[derive(Clone, Default)]
pub struct Gated {
    pub gate: CancellationToken,
    pub entered: Arc<AtomicU32>,
}

impl Gated {
    pub const KIND: &'static str = "gated";

    pub fn open(&self) {
        self.gate.cancel();
    }
}

#[async_trait]
impl Feature for Gated {
    fn kind(&self) -> FeatureKind {
        FeatureKind::new(Self::KIND)
    }

    async fn execute(&self, ctx: FeatureContext<'_>) -> Result<MediaBuffers, FeatureError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            () = self.gate.cancelled() => Ok(ctx.source().clone()),
            () = ctx.canceled() => Err(FeatureError::Canceled),
        }
    }
}

/// Fails transiently a fixed number of times, then succeeds.
#[derive(Clone)]
pub struct Flaky {
    pub failures_left: Arc<AtomicU32>,
    pub calls: Arc<AtomicU32>,
}

impl Flaky {
    pub const KIND: &'static str = "flaky";

    pub fn new(failures: u32) -> Self {
        Self {
            failures_left: Arc::new(AtomicU32::new(failures)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl Feature for Flaky {
    fn kind(&self) -> FeatureKind {
        FeatureKind::new(Self::KIND)
    }

    async fn execute(&self, ctx: FeatureContext<'_>) -> Result<MediaBuffers, FeatureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(FeatureError::Transient(format!("device busy ({left} left)")));
        }
        Ok(ctx.source().clone())
    }
}

/// Always fails fatally.
#[derive(Clone, Default)]
pub struct Corrupt {
    pub calls: Arc<AtomicU32>,
}

impl Corrupt {
    pub const KIND: &'static str = "corrupt";
}

#[async_trait]
impl Feature for Corrupt {
    fn kind(&self) -> FeatureKind {
        FeatureKind::new(Self::KIND)
    }

    async fn execute(&self, _ctx: FeatureContext<'_>) -> Result<MediaBuffers, FeatureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FeatureError::Fatal("source frames are corrupted".into()))
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub scheduler: Scheduler,
    pub repository: InMemoryJobRepository,
    pub proxy: InMemoryMediaProxy,
    pub diagnostics: InMemoryDiagnosticsSink,
    pub mailbox: InMemoryOutputMailbox,
    pub recording: Recording,
    pub gated: Gated,
    pub flaky: Flaky,
    pub corrupt: Corrupt,
}

pub fn test_config(budget: usize) -> SchedulerConfig {
    SchedulerConfig::new()
        .with_concurrency_budget(budget)
        .with_max_queue_depth(64)
        .with_hard_timeout(Duration::from_secs(10))
        .with_cancel_grace(Duration::from_millis(200))
        .with_max_transient_retries(3)
        .with_retry_backoff(BackoffConfig::new(1, 4))
        .with_repository_backoff(BackoffConfig::new(5, 20))
        .with_thread_stack_size(512 * 1024)
}

pub struct HarnessBuilder {
    config: SchedulerConfig,
    repository: InMemoryJobRepository,
    proxy: InMemoryMediaProxy,
    recording: Recording,
    gated: Gated,
    flaky: Flaky,
    stubborn: Option<Stubborn>,
}

impl HarnessBuilder {
    pub fn new(budget: usize) -> Self {
        Self {
            config: test_config(budget),
            repository: InMemoryJobRepository::new(),
            proxy: InMemoryMediaProxy::new(),
            recording: Recording::default(),
            gated: Gated::default(),
            flaky: Flaky::new(0),
            stubborn: None,
        }
    }

    pub fn config(mut self, f: impl FnOnce(SchedulerConfig) -> SchedulerConfig) -> Self {
        self.config = f(self.config);
        self
    }

    pub fn repository(mut self, repository: InMemoryJobRepository) -> Self {
        self.repository = repository;
        self
    }

    pub fn proxy(mut self, proxy: InMemoryMediaProxy) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn flaky(mut self, flaky: Flaky) -> Self {
        self.flaky = flaky;
        self
    }

    pub fn stubborn(mut self, block_for: Duration) -> Self {
        self.stubborn = Some(Stubborn { block_for });
        self
    }

    pub fn start(self) -> Harness {
        init_test_tracing();
        let diagnostics = InMemoryDiagnosticsSink::new(1024);
        let mailbox = InMemoryOutputMailbox::new();
        let corrupt = Corrupt::default();
        let mut registry = FeatureRegistry::new()
            .with_feature(self.recording.clone())
            .with_feature(self.gated.clone())
            .with_feature(self.flaky.clone())
            .with_feature(corrupt.clone());
        if let Some(stubborn) = self.stubborn {
            registry.register(Arc::new(stubborn));
        }
        let scheduler = SchedulerBuilder::new(self.config)
            .with_registry(registry)
            .with_repository(self.repository.clone())
            .with_proxy(Arc::new(self.proxy.clone()))
            .with_diagnostics(diagnostics.clone())
            .with_mailbox(mailbox.clone())
            .build()
            .expect("scheduler starts");
        Harness {
            scheduler,
            repository: self.repository,
            proxy: self.proxy,
            diagnostics,
            mailbox,
            recording: self.recording,
            gated: self.gated,
            flaky: self.flaky,
            corrupt,
        }
    }
}

impl Harness {
    /// Submit a job whose buffers are also registered with the proxy.
    pub fn submit(&self, session: &str, feature: &str, priority: Priority) -> JobId {
        self.submit_request(self.request(session, feature).with_priority(priority))
    }

    pub fn request(&self, session: &str, feature: &str) -> JobRequest {
        let reference = format!("{session}/raw-{}", uuid::Uuid::new_v4());
        let source = MediaBuffers::single(reference, vec![42; 32]);
        JobRequest::new(SessionId::new(session), feature, source)
    }

    pub fn submit_request(&self, request: JobRequest) -> JobId {
        self.proxy.store(&request.source);
        self.scheduler.submit_job(request).expect("job accepted")
    }

    pub fn wait_for(&self, job_id: &JobId, state: JobState) -> bool {
        wait_for_state(&self.scheduler, job_id, state, Duration::from_secs(5))
    }
}

pub fn wait_for_state(scheduler: &Scheduler, job_id: &JobId, state: JobState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if scheduler.query_job(job_id).ok().flatten() == Some(state) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
