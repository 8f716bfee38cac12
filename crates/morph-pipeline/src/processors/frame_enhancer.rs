//! Whole-frame super-resolution.
//!
//! Real-ESRGAN runs over overlapping tiles so large frames stay within the
//! model's input size; the upscaled frame is then blended over the original
//! stretched to the same size.

use super::{model_available, BoundModel, FrameProcessor, RunContext};
use crate::config::ProcessorKind;
use morph_core::backend::first_output;
use morph_core::models;
use morph_core::tensor::{frame_to_nchw, nchw_to_frame, ChannelOrder, Normalization};
use morph_core::{BackendError, ModelBackend, SessionHandle};
use morph_media::{blend, read_image, save_image, Frame};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Core tile edge fed to the upscaler, before overlap.
const TILE_SIZE: u32 = 256;
/// Context pixels added around each tile to hide seams.
const TILE_OVERLAP: u32 = 16;

/// Whole-frame super resolution, tiled.
pub struct FrameEnhancer {
    model: BoundModel,
}

impl FrameEnhancer {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            model: BoundModel::new(backend),
        }
    }

    fn upscale(&self, frame: &Frame) -> Result<Frame, BackendError> {
        let handle = self
            .model
            .handle()
            .ok_or_else(|| BackendError::InferenceFailed("frame enhancer has no session".into()))?;
        upscale_tiled(frame, |tile| self.upscale_tile(handle, tile))
    }

    fn upscale_tile(&self, handle: &SessionHandle, tile: &Frame) -> Result<Frame, BackendError> {
        let input = frame_to_nchw(tile, Normalization::uniform(0.0, 255.0), ChannelOrder::Rgb);
        let output = first_output(self.model.backend().infer(handle, vec![input])?, handle)?;
        nchw_to_frame(&output, ChannelOrder::Rgb, |v| v.clamp(0.0, 1.0) * 255.0)
            .ok_or_else(|| BackendError::InferenceFailed(format!("{handle}: unexpected output shape {:?}", output.shape())))
    }
}

/// Run `upscale` over overlapping tiles and stitch the cores together.
///
/// The scale factor is read from the first tile's output.
fn upscale_tiled<F>(frame: &Frame, mut upscale: F) -> Result<Frame, BackendError>
where
    F: FnMut(&Frame) -> Result<Frame, BackendError>,
{
    let mut result: Option<Frame> = None;
    let mut scale = 1u32;

    for ty in (0..frame.height).step_by(TILE_SIZE as usize) {
        for tx in (0..frame.width).step_by(TILE_SIZE as usize) {
            let x0 = tx.saturating_sub(TILE_OVERLAP);
            let y0 = ty.saturating_sub(TILE_OVERLAP);
            let x1 = (tx + TILE_SIZE + TILE_OVERLAP).min(frame.width);
            let y1 = (ty + TILE_SIZE + TILE_OVERLAP).min(frame.height);

            let mut tile = Frame::filled(x1 - x0, y1 - y0, [0, 0, 0]);
            for y in y0..y1 {
                for x in x0..x1 {
                    tile.put_pixel(x - x0, y - y0, frame.pixel(x, y));
                }
            }

            let upscaled = upscale(&tile)?;
            if result.is_none() {
                scale = (upscaled.width / tile.width.max(1)).max(1);
            }
            let canvas = result.get_or_insert_with(|| Frame::filled(frame.width * scale, frame.height * scale, [0, 0, 0]));

            let core_x1 = (tx + TILE_SIZE).min(frame.width);
            let core_y1 = (ty + TILE_SIZE).min(frame.height);
            for y in (ty * scale)..(core_y1 * scale) {
                for x in (tx * scale)..(core_x1 * scale) {
                    canvas.put_pixel(x, y, upscaled.pixel(x - x0 * scale, y - y0 * scale));
                }
            }
        }
    }

    Ok(result.unwrap_or_else(|| frame.clone()))
}

impl FrameProcessor for FrameEnhancer {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::FrameEnhancer
    }

    fn pre_check(&mut self, ctx: &RunContext<'_>) -> bool {
        model_available(&ctx.config.frame_enhancer_model, &ctx.config.model_dir, ctx.config.skip_download)
    }

    fn pre_process(&mut self, ctx: &RunContext<'_>) -> bool {
        if ctx.config.frame_enhancer_blend > 100 {
            tracing::warn!(stage = self.name(), "frame enhancer blend must be within [0, 100]");
            return false;
        }
        true
    }

    fn post_models(&mut self, ctx: &RunContext<'_>) -> Result<(), BackendError> {
        let spec = models::lookup(&ctx.config.frame_enhancer_model)?;
        self.model.bind(spec, ctx.device)
    }

    fn process_image(&mut self, ctx: &RunContext<'_>, _sources: &[PathBuf], input: &Path, output: &Path) -> bool {
        let Some(frame) = read_image(input) else {
            tracing::warn!(stage = self.name(), path = %input.display(), "unreadable input");
            return false;
        };

        let upscaled = match self.upscale(&frame) {
            Ok(upscaled) => upscaled,
            Err(e) => {
                tracing::warn!(stage = self.name(), error = %e, "upscale failed");
                return false;
            }
        };
        // Blend against the original stretched to the new size.
        let base = frame.resize(upscaled.width, upscaled.height);
        let blended = match blend(&base, &upscaled, ctx.config.frame_enhancer_blend) {
            Ok(blended) => blended,
            Err(e) => {
                tracing::warn!(stage = self.name(), error = %e, "blend failed");
                return false;
            }
        };
        tracing::debug!(
            stage = self.name(),
            from = ?(frame.width, frame.height),
            to = ?(blended.width, blended.height),
            "frame enhanced"
        );

        match save_image(output, &blended, ctx.config.output_image_quality) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(stage = self.name(), path = %output.display(), error = %e, "write failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nearest_double(tile: &Frame) -> Result<Frame, BackendError> {
        let mut out = Frame::filled(tile.width * 2, tile.height * 2, [0, 0, 0]);
        for y in 0..out.height {
            for x in 0..out.width {
                out.put_pixel(x, y, tile.pixel(x / 2, y / 2));
            }
        }
        Ok(out)
    }

    #[test]
    fn test_tiled_upscale_matches_whole_frame() {
        let mut frame = Frame::filled(300, 270, [0, 0, 0]);
        for y in 0..frame.height {
            for x in 0..frame.width {
                frame.put_pixel(x, y, [(x % 251) as u8, (y % 251) as u8, ((x + y) % 251) as u8]);
            }
        }
        let tiled = upscale_tiled(&frame, nearest_double).unwrap();
        let whole = nearest_double(&frame).unwrap();
        assert_eq!((tiled.width, tiled.height), (600, 540));
        assert_eq!(tiled, whole);
    }

    #[test]
    fn test_tile_failure_propagates() {
        let frame = Frame::filled(10, 10, [1, 1, 1]);
        let result = upscale_tiled(&frame, |_| Err(BackendError::InferenceFailed("boom".into())));
        assert!(result.is_err());
    }
}
