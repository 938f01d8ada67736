//! Box-filter smoothing, standing in for multi-frame noise reduction.

use async_trait::async_trait;

use crate::core::{Feature, FeatureContext, FeatureError, MediaBuffer, MediaBuffers};
use crate::features::{chunk_boundary, CHUNK_SIZE};
use crate::util::ids::FeatureKind;

/// Registered kind.
pub const KIND: &str = "noise_reduction";

/// Largest accepted filter radius.
pub const MAX_RADIUS: usize = 16;

/// Replaces each byte by the mean of its `radius` neighbourhood (default 1).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseReduction;

#[async_trait]
impl Feature for NoiseReduction {
    fn kind(&self) -> FeatureKind {
        FeatureKind::new(KIND)
    }

    async fn execute(&self, ctx: FeatureContext<'_>) -> Result<MediaBuffers, FeatureError> {
        let radius = ctx.f64_param("radius", 1.0);
        if !(0.0..=MAX_RADIUS as f64).contains(&radius) {
            return Err(FeatureError::Fatal(format!(
                "radius must be within 0..={MAX_RADIUS}, got {radius}"
            )));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let radius = radius as usize;

        let mut output = Vec::with_capacity(ctx.source().len());
        for buffer in ctx.source().buffers() {
            let data = &buffer.data;
            let mut smoothed = Vec::with_capacity(data.len());
            let mut offset = 0;
            while offset < data.len() {
                chunk_boundary(&ctx).await?;
                let end = (offset + CHUNK_SIZE).min(data.len());
                smoothed.extend((offset..end).map(|i| smooth_at(data, i, radius)));
                offset = end;
            }
            output.push(MediaBuffer::new(format!("{}.denoised", buffer.reference), smoothed));
        }
        Ok(MediaBuffers::new(output))
    }
}

fn smooth_at(data: &[u8], index: usize, radius: usize) -> u8 {
    let start = index.saturating_sub(radius);
    let end = (index + radius + 1).min(data.len());
    let window = &data[start..end];
    let sum: usize = window.iter().map(|&b| usize::from(b)).sum();
    u8::try_from(sum / window.len()).unwrap_or(u8::MAX)
}
