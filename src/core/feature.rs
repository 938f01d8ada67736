//! Processing feature abstraction and the registry they are looked up in.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::buffers::MediaBuffers;
use crate::core::job::JobParameters;
use crate::util::ids::{FeatureKind, JobId};

/// Errors a feature can return from [`Feature::execute`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeatureError {
    /// May succeed on retry, e.g. a resource is temporarily unavailable.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Unrecoverable, e.g. corrupted source buffers.
    #[error("fatal failure: {0}")]
    Fatal(String),
    /// The feature observed the cancellation flag and stopped.
    #[error("canceled")]
    Canceled,
}

/// Borrowed view of one job handed to a feature for a single attempt.
///
/// Nothing in the context can outlive the call; features that need to keep
/// data must copy it into their output.
pub struct FeatureContext<'a> {
    job_id: &'a JobId,
    source: &'a MediaBuffers,
    parameters: &'a JobParameters,
    attempt: u32,
    cancel: &'a CancellationToken,
}

impl<'a> FeatureContext<'a> {
    /// Build a context.
    #[must_use]
    pub const fn new(
        job_id: &'a JobId,
        source: &'a MediaBuffers,
        parameters: &'a JobParameters,
        attempt: u32,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            job_id,
            source,
            parameters,
            attempt,
            cancel,
        }
    }

    /// Job being processed.
    #[must_use]
    pub const fn job_id(&self) -> &JobId {
        self.job_id
    }

    /// Source buffers.
    #[must_use]
    pub const fn source(&self) -> &MediaBuffers {
        self.source
    }

    /// Feature parameters.
    #[must_use]
    pub const fn parameters(&self) -> &JobParameters {
        self.parameters
    }

    /// Numeric parameter lookup with a default.
    #[must_use]
    pub fn f64_param(&self, name: &str, default: f64) -> f64 {
        self.parameters
            .get(name)
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(default)
    }

    /// 1-based attempt number.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn canceled(&self) {
        self.cancel.cancelled().await;
    }

    /// Cooperative cancellation point.
    ///
    /// # Errors
    ///
    /// [`FeatureError::Canceled`] once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), FeatureError> {
        if self.is_canceled() {
            Err(FeatureError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// A pluggable processing algorithm.
///
/// `execute` runs on a dedicated worker thread with its own single-threaded
/// tokio runtime, so blocking or CPU-heavy work does not stall the scheduler.
/// Implementations should call [`FeatureContext::checkpoint`] regularly.
#[async_trait]
pub trait Feature: Send + Sync + 'static {
    /// Kind this feature is registered under.
    fn kind(&self) -> FeatureKind;

    /// Consume the borrowed source buffers and produce output buffers.
    async fn execute(&self, ctx: FeatureContext<'_>) -> Result<MediaBuffers, FeatureError>;
}

/// Features registered at startup, keyed by kind.
#[derive(Clone, Default)]
pub struct FeatureRegistry {
    features: HashMap<FeatureKind, Arc<dyn Feature>>,
}

impl FeatureRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feature under its own kind, replacing any previous one.
    pub fn register(&mut self, feature: Arc<dyn Feature>) {
        let kind = feature.kind();
        if self.features.insert(kind.clone(), feature).is_some() {
            tracing::warn!(feature = %kind, "feature registration replaced an existing one");
        }
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with_feature(mut self, feature: impl Feature) -> Self {
        self.register(Arc::new(feature));
        self
    }

    /// Look up a feature.
    #[must_use]
    pub fn get(&self, kind: &FeatureKind) -> Option<Arc<dyn Feature>> {
        self.features.get(kind).cloned()
    }

    /// Whether a kind is registered.
    #[must_use]
    pub fn contains(&self, kind: &FeatureKind) -> bool {
        self.features.contains_key(kind)
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<FeatureKind> {
        let mut kinds: Vec<_> = self.features.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Number of registered features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
