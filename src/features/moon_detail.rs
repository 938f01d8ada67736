//! Contrast boost around mid-grey, standing in for moon detail enhancement.

use async_trait::async_trait;

use crate::core::{Feature, FeatureContext, FeatureError, MediaBuffer, MediaBuffers};
use crate::features::{chunk_boundary, CHUNK_SIZE};
use crate::util::ids::FeatureKind;

/// Registered kind.
pub const KIND: &str = "moon_detail_boost";

/// Scales every byte's distance from 128 by the `gain` parameter (default 1.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct MoonDetailBoost;

#[async_trait]
impl Feature for MoonDetailBoost {
    fn kind(&self) -> FeatureKind {
        FeatureKind::new(KIND)
    }

    async fn execute(&self, ctx: FeatureContext<'_>) -> Result<MediaBuffers, FeatureError> {
        let gain = ctx.f64_param("gain", 1.5);
        if !gain.is_finite() || gain <= 0.0 {
            return Err(FeatureError::Fatal(format!("invalid gain {gain}")));
        }

        let mut output = Vec::with_capacity(ctx.source().len());
        for buffer in ctx.source().buffers() {
            let mut data = Vec::with_capacity(buffer.data.len());
            for chunk in buffer.data.chunks(CHUNK_SIZE) {
                chunk_boundary(&ctx).await?;
                data.extend(chunk.iter().map(|&b| boost(b, gain)));
            }
            output.push(MediaBuffer::new(format!("{}.moon", buffer.reference), data));
        }
        Ok(MediaBuffers::new(output))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn boost(byte: u8, gain: f64) -> u8 {
    let centered = f64::from(byte) - 128.0;
    (centered * gain + 128.0).round().clamp(0.0, 255.0) as u8
}
