//! GFPGAN face restoration, blended back at `face_enhancer_blend`.

use super::{model_available, select_target_faces, BoundModel, FrameProcessor, RunContext};
use crate::config::ProcessorKind;
use morph_core::alignment::{paste_back, warp_face, FFHQ_512};
use morph_core::backend::first_output;
use morph_core::mask::box_mask;
use morph_core::models;
use morph_core::tensor::{frame_to_nchw, nchw_to_frame, ChannelOrder, Normalization};
use morph_core::{BackendError, Face, ModelBackend};
use morph_media::{blend, read_image, save_image, Frame};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ENHANCER_CROP_SIZE: usize = 512;

/// GFPGAN-style face restoration, blended over the original face.
pub struct FaceEnhancer {
    model: BoundModel,
}

impl FaceEnhancer {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            model: BoundModel::new(backend),
        }
    }

    fn enhance(&self, ctx: &RunContext<'_>, frame: &Frame, face: &Face) -> Result<Frame, BackendError> {
        let handle = self
            .model
            .handle()
            .ok_or_else(|| BackendError::InferenceFailed("face enhancer has no session".into()))?;

        let (crop, matrix) = warp_face(frame, &face.landmarks, &FFHQ_512, ENHANCER_CROP_SIZE);
        let input = frame_to_nchw(&crop, Normalization::uniform(127.5, 127.5), ChannelOrder::Rgb);
        let output = first_output(self.model.backend().infer(handle, vec![input])?, handle)?;
        let restored = nchw_to_frame(&output, ChannelOrder::Rgb, |v| (v.clamp(-1.0, 1.0) + 1.0) / 2.0 * 255.0)
            .ok_or_else(|| BackendError::InferenceFailed(format!("{handle}: unexpected output shape {:?}", output.shape())))?;

        let padding = ctx.config.padding().unwrap_or_default();
        let mask = box_mask(restored.width as usize, restored.height as usize, ctx.config.face_mask_blur, padding);
        let mut pasted = frame.clone();
        paste_back(&mut pasted, &restored, &mask, &matrix);

        blend(frame, &pasted, ctx.config.face_enhancer_blend)
            .map_err(|e| BackendError::InferenceFailed(e.to_string()))
    }
}

impl FrameProcessor for FaceEnhancer {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::FaceEnhancer
    }

    fn pre_check(&mut self, ctx: &RunContext<'_>) -> bool {
        ctx.analyser.pre_check(&ctx.analyser_options())
            && model_available(&ctx.config.face_enhancer_model, &ctx.config.model_dir, ctx.config.skip_download)
    }

    fn pre_process(&mut self, ctx: &RunContext<'_>) -> bool {
        if ctx.config.face_enhancer_blend > 100 {
            tracing::warn!(
                stage = self.name(),
                blend = ctx.config.face_enhancer_blend,
                "face enhancer blend must be within [0, 100]"
            );
            return false;
        }
        true
    }

    fn post_models(&mut self, ctx: &RunContext<'_>) -> Result<(), BackendError> {
        let spec = models::lookup(&ctx.config.face_enhancer_model)?;
        self.model.bind(spec, ctx.device)
    }

    /// Faces that cannot be resolved are skipped; only failed inference or
    /// writes stop the pipeline.
    fn process_image(&mut self, ctx: &RunContext<'_>, _sources: &[PathBuf], input: &Path, output: &Path) -> bool {
        let Some(mut frame) = read_image(input) else {
            tracing::warn!(stage = self.name(), path = %input.display(), "unreadable input");
            return false;
        };

        let targets = select_target_faces(ctx, &frame);
        if targets.is_empty() {
            tracing::info!(stage = self.name(), "no face to enhance, skipping");
            return true;
        }

        for face in &targets {
            match self.enhance(ctx, &frame, face) {
                Ok(enhanced) => frame = enhanced,
                Err(e) => {
                    tracing::warn!(stage = self.name(), error = %e, "enhancement failed");
                    return false;
                }
            }
        }

        match save_image(output, &frame, ctx.config.output_image_quality) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(stage = self.name(), path = %output.display(), error = %e, "write failed");
                false
            }
        }
    }

    fn reference_frame(&mut self, ctx: &RunContext<'_>, reference: &Face, frame: &Frame) -> Option<Frame> {
        self.enhance(ctx, frame, reference).ok()
    }
}
