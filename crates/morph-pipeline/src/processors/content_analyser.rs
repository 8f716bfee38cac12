use super::{model_available, BoundModel, FrameProcessor, RunContext, Screening};
use crate::config::ProcessorKind;
use morph_core::backend::first_output;
use morph_core::models;
use morph_core::tensor::{frame_to_nhwc, ChannelOrder, Normalization};
use morph_core::{BackendError, ModelBackend};
use morph_media::{read_image, Frame};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const NSFW_MODEL: &str = "open_nsfw";
const NSFW_INPUT_SIZE: u32 = 224;
const NSFW_NORMALIZATION: Normalization = Normalization {
    mean: [104.0, 117.0, 123.0],
    std: [1.0, 1.0, 1.0],
};
const NSFW_THRESHOLD: f32 = 0.80;

/// Screens the target for unsafe content before anything is written.
pub struct ContentAnalyser {
    model: BoundModel,
}

impl ContentAnalyser {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            model: BoundModel::new(backend),
        }
    }

    /// Probability that `frame` is unsafe.
    fn analyse(&self, frame: &Frame) -> Result<f32, BackendError> {
        let handle = self
            .model
            .handle()
            .ok_or_else(|| BackendError::InferenceFailed("content analyser has no session".into()))?;
        let resized = frame.resize(NSFW_INPUT_SIZE, NSFW_INPUT_SIZE);
        let input = frame_to_nhwc(&resized, NSFW_NORMALIZATION, ChannelOrder::Bgr);
        let output = first_output(self.model.backend().infer(handle, vec![input])?, handle)?;
        output
            .iter()
            .nth(1)
            .copied()
            .ok_or_else(|| BackendError::InferenceFailed(format!("{handle}: expected [safe, unsafe] output")))
    }
}

impl FrameProcessor for ContentAnalyser {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::ContentAnalyser
    }

    fn pre_check(&mut self, ctx: &RunContext<'_>) -> bool {
        model_available(NSFW_MODEL, &ctx.config.model_dir, ctx.config.skip_download)
    }

    fn pre_process(&mut self, _ctx: &RunContext<'_>) -> bool {
        true
    }

    fn post_models(&mut self, ctx: &RunContext<'_>) -> Result<(), BackendError> {
        self.model.bind(models::lookup(NSFW_MODEL)?, ctx.device)
    }

    /// Screening already happened; the image passes through untouched.
    fn process_image(&mut self, _ctx: &RunContext<'_>, _sources: &[PathBuf], _input: &Path, _output: &Path) -> bool {
        true
    }

    /// A target that cannot be analysed is flagged.
    fn screen_target(&mut self, ctx: &RunContext<'_>, target: &Path) -> Screening {
        if !ctx.config.skip_nsfw {
            return Screening::Pass;
        }
        let Some(frame) = read_image(target) else {
            tracing::warn!(stage = self.name(), path = %target.display(), "unreadable target");
            return Screening::Flagged;
        };
        match self.analyse(&frame) {
            Ok(probability) if probability > NSFW_THRESHOLD => {
                tracing::warn!(stage = self.name(), probability, "target flagged as unsafe");
                Screening::Flagged
            }
            Ok(probability) => {
                tracing::debug!(stage = self.name(), probability, "target passed content screen");
                Screening::Pass
            }
            Err(e) => {
                tracing::warn!(stage = self.name(), error = %e, "content analysis failed");
                Screening::Flagged
            }
        }
    }
}
