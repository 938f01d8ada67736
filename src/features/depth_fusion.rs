//! Fuses a burst of frames into one by per-byte averaging.

use async_trait::async_trait;

use crate::core::{Feature, FeatureContext, FeatureError, MediaBuffer, MediaBuffers};
use crate::features::{chunk_boundary, CHUNK_SIZE};
use crate::util::ids::FeatureKind;

/// Registered kind.
pub const KIND: &str = "depth_fusion";

/// Averages two or more equally sized source buffers into one output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthFusion;

#[async_trait]
impl Feature for DepthFusion {
    fn kind(&self) -> FeatureKind {
        FeatureKind::new(KIND)
    }

    async fn execute(&self, ctx: FeatureContext<'_>) -> Result<MediaBuffers, FeatureError> {
        let frames = ctx.source().buffers();
        let Some(first) = frames.first() else {
            return Err(FeatureError::Fatal("no frames to fuse".into()));
        };
        if frames.len() < 2 {
            return Err(FeatureError::Fatal(format!(
                "depth fusion needs at least 2 frames, got {}",
                frames.len()
            )));
        }
        let len = first.data.len();
        if frames.iter().any(|f| f.data.len() != len) {
            return Err(FeatureError::Fatal("frames differ in size".into()));
        }

        let count = frames.len() as u64;
        let mut fused = Vec::with_capacity(len);
        let mut offset = 0;
        while offset < len {
            chunk_boundary(&ctx).await?;
            let end = (offset + CHUNK_SIZE).min(len);
            for i in offset..end {
                let sum: u64 = frames.iter().map(|f| u64::from(f.data[i])).sum();
                fused.push(u8::try_from(sum / count).unwrap_or(u8::MAX));
            }
            offset = end;
        }
        Ok(MediaBuffers::new(vec![MediaBuffer::new(
            format!("{}.fused", first.reference),
            fused,
        )]))
    }
}
