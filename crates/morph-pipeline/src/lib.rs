//! morph-pipeline — frame-processor orchestration.
//!
//! [`Orchestrator`] sequences the configured [`processors`] over one target
//! image, resolving reference faces first and rebinding model sessions when
//! the execution device changes. [`swap_face`] wraps a whole run behind a
//! few knobs.

pub mod config;
pub mod ledger;
pub mod orchestrator;
pub mod processors;
pub mod resources;

pub use config::{ConfigError, FaceSelectorMode, PipelineConfig, ProcessorKind};
pub use ledger::DeviceLedger;
pub use orchestrator::{AbortReason, CancelToken, Orchestrator, RunReport, RunState};
pub use processors::{FrameProcessor, ProcessorRegistry, ProcessorState, RunContext, Screening};

use morph_core::Device;
use morph_media::{read_image, Frame, MediaError, ScratchDir};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("media: {0}")]
    Media(#[from] MediaError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A face swap described by a handful of knobs.
#[derive(Debug, Clone)]
pub struct SwapRequest {
    pub sources: Vec<PathBuf>,
    pub target: PathBuf,
    /// Where to write; a temp PNG when `None`.
    pub output: Option<PathBuf>,
    pub device: Option<Device>,
    pub face_detector_score: Option<f32>,
    pub face_mask_blur: Option<f32>,
    pub skip_nsfw: bool,
    pub face_swapper: bool,
    pub face_restore: bool,
}

impl SwapRequest {
    pub fn new(sources: Vec<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            target: target.into(),
            output: None,
            device: None,
            face_detector_score: Some(0.65),
            face_mask_blur: Some(0.7),
            skip_nsfw: true,
            face_swapper: true,
            face_restore: true,
        }
    }

    /// Overlay this request on `base`.
    pub fn to_config(&self, base: PipelineConfig) -> PipelineConfig {
        let mut processors = Vec::new();
        if self.skip_nsfw {
            processors.push(ProcessorKind::ContentAnalyser);
        }
        if self.face_swapper {
            processors.push(ProcessorKind::FaceSwapper);
        }
        if self.face_restore {
            processors.push(ProcessorKind::FaceEnhancer);
        }
        PipelineConfig {
            sources: self.sources.clone(),
            target: Some(self.target.clone()),
            output: self.output.clone(),
            processors,
            device: self.device.or(base.device),
            face_detector_score: self.face_detector_score.unwrap_or(base.face_detector_score),
            face_mask_blur: self.face_mask_blur.unwrap_or(base.face_mask_blur),
            skip_nsfw: self.skip_nsfw,
            ..base
        }
    }
}

/// Run one swap with the environment's defaults.
///
/// Returns the output path, or `None` when the run aborted.
pub fn swap_face(request: &SwapRequest) -> Result<Option<PathBuf>, PipelineError> {
    let base = PipelineConfig::from_env();
    let mut orchestrator = Orchestrator::from_config(&base);
    swap_face_with(&mut orchestrator, request, base)
}

/// [`swap_face`] on a caller-supplied orchestrator and base configuration.
///
/// Without an explicit output the result lands in a temp PNG that is kept
/// only when the run validates.
pub fn swap_face_with(
    orchestrator: &mut Orchestrator,
    request: &SwapRequest,
    base: PipelineConfig,
) -> Result<Option<PathBuf>, PipelineError> {
    let mut request = request.clone();
    let staged = match request.output {
        Some(_) => None,
        None => {
            let staged = tempfile::Builder::new()
                .prefix("morph-")
                .suffix(".png")
                .tempfile()?
                .into_temp_path();
            request.output = Some(staged.to_path_buf());
            Some(staged)
        }
    };
    let config = request.to_config(base);
    config.validate()?;

    let report = orchestrator.run(&config, &CancelToken::new());
    let output = report.is_success().then_some(report.output).flatten();
    if let Some(staged) = staged {
        if output.as_deref() == Some(&*staged) {
            staged.keep().map_err(|e| e.error)?;
        }
    }
    Ok(output)
}

/// In-memory form of [`swap_face`] for callers holding decoded frames.
///
/// Frames are staged as PNGs in a scratch directory removed on return.
pub fn swap_frames(
    orchestrator: &mut Orchestrator,
    config: &PipelineConfig,
    sources: &[Frame],
    target: &Frame,
) -> Result<Option<Frame>, PipelineError> {
    let scratch = ScratchDir::new()?;
    let source_paths = sources
        .iter()
        .enumerate()
        .map(|(i, frame)| scratch.write_frame(&format!("source-{i}"), frame))
        .collect::<Result<Vec<_>, _>>()?;
    let target_path = scratch.write_frame("target", target)?;

    let config = PipelineConfig {
        sources: source_paths,
        target: Some(target_path),
        output: Some(scratch.file("output.png")),
        ..config.clone()
    };
    let report = orchestrator.run(&config, &CancelToken::new());
    Ok(report
        .output
        .filter(|_| report.state == RunState::Validated)
        .and_then(|path| read_image(&path)))
}
