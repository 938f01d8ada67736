//! Bundled reference features.
//!
//! These are simple byte-level transformations, not production image
//! algorithms. They exist to exercise the registry and the cooperative
//! cancellation contract: every feature works through its input in fixed-size
//! chunks and checks for cancellation between chunks.

pub mod depth_fusion;
pub mod moon_detail;
pub mod noise_reduction;

pub use depth_fusion::DepthFusion;
pub use moon_detail::MoonDetailBoost;
pub use noise_reduction::NoiseReduction;

use crate::core::{FeatureContext, FeatureError, FeatureRegistry};

/// Bytes processed between two cancellation checks.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Registry holding every bundled feature.
#[must_use]
pub fn default_registry() -> FeatureRegistry {
    FeatureRegistry::new()
        .with_feature(MoonDetailBoost)
        .with_feature(DepthFusion)
        .with_feature(NoiseReduction)
}

/// Cancellation check plus a yield so the worker runtime stays responsive.
pub(crate) async fn chunk_boundary(ctx: &FeatureContext<'_>) -> Result<(), FeatureError> {
    ctx.checkpoint()?;
    tokio::task::yield_now().await;
    Ok(())
}
