//! Frame processors: the swappable stages of a pipeline.
//!
//! Every stage implements [`FrameProcessor`]. The orchestrator resolves the
//! configured [`ProcessorKind`] list through a [`ProcessorRegistry`] once per
//! run and drives each stage through the same lifecycle:
//! `pre_check → pre_process → post_models (on device change) → process_image → post_process`.

mod content_analyser;
mod face_enhancer;
mod face_swapper;
mod frame_enhancer;

pub use content_analyser::ContentAnalyser;
pub use face_enhancer::FaceEnhancer;
pub use face_swapper::FaceSwapper;
pub use frame_enhancer::FrameEnhancer;

use crate::config::{FaceSelectorMode, PipelineConfig, ProcessorKind};
use morph_core::models::{self, ModelSpec};
use morph_core::{
    find_similar_faces, select_one, AnalyserOptions, BackendError, Device, Face, FaceAnalysis, FaceStore,
    ModelBackend, SessionHandle,
};
use morph_media::Frame;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read-only view of the run a processor is called from.
pub struct RunContext<'a> {
    pub config: &'a PipelineConfig,
    pub analyser: &'a dyn FaceAnalysis,
    pub store: &'a FaceStore,
    pub device: Device,
}

impl RunContext<'_> {
    pub fn analyser_options(&self) -> AnalyserOptions {
        self.config.analyser_options(self.device)
    }
}

/// Verdict of a pre-processing content screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screening {
    Pass,
    Flagged,
}

/// Uniform lifecycle of a pipeline stage.
pub trait FrameProcessor: Send {
    fn kind(&self) -> ProcessorKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Are the model assets this stage needs available? May download them.
    fn pre_check(&mut self, ctx: &RunContext<'_>) -> bool;

    /// Is the configuration usable by this stage? `false` aborts the run.
    fn pre_process(&mut self, ctx: &RunContext<'_>) -> bool;

    /// Release the session bound to the previous device and bind one to
    /// `ctx.device`. A no-op when already bound there.
    fn post_models(&mut self, ctx: &RunContext<'_>) -> Result<(), BackendError>;

    /// Transform the image at `input` into `output` (possibly the same path).
    /// `false` stops the pipeline.
    fn process_image(&mut self, ctx: &RunContext<'_>, sources: &[PathBuf], input: &Path, output: &Path) -> bool;

    /// Drop per-call transient state. Called after every `process_image`.
    fn post_process(&mut self) {}

    /// What this stage would make of `frame`, for reference bootstrap.
    fn reference_frame(&mut self, _ctx: &RunContext<'_>, _reference: &Face, _frame: &Frame) -> Option<Frame> {
        None
    }

    /// Screen the target before anything is written.
    fn screen_target(&mut self, _ctx: &RunContext<'_>, _target: &Path) -> Screening {
        Screening::Pass
    }
}

/// Per-processor runtime record kept by the orchestrator across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorState {
    pub kind: ProcessorKind,
    pub active: bool,
    /// Device the processor last bound its sessions to.
    pub last_bound_device: Option<Device>,
}

impl ProcessorState {
    pub fn new(kind: ProcessorKind) -> Self {
        Self {
            kind,
            active: false,
            last_bound_device: None,
        }
    }

    pub fn needs_reload(&self, device: Device) -> bool {
        self.last_bound_device != Some(device)
    }
}

/// What processor constructors receive.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub backend: Arc<dyn ModelBackend>,
}

type Constructor = Box<dyn Fn(&ProcessorDeps) -> Box<dyn FrameProcessor> + Send + Sync>;

/// Maps processor kinds to constructors.
pub struct ProcessorRegistry {
    constructors: HashMap<ProcessorKind, Constructor>,
}

impl ProcessorRegistry {
    /// A registry with no processors.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// The four built-in processors.
    pub fn builtin() -> Self {
        Self::empty()
            .with(ProcessorKind::ContentAnalyser, |deps| {
                Box::new(ContentAnalyser::new(deps.backend.clone()))
            })
            .with(ProcessorKind::FaceSwapper, |deps| Box::new(FaceSwapper::new(deps.backend.clone())))
            .with(ProcessorKind::FaceEnhancer, |deps| Box::new(FaceEnhancer::new(deps.backend.clone())))
            .with(ProcessorKind::FrameEnhancer, |deps| {
                Box::new(FrameEnhancer::new(deps.backend.clone()))
            })
    }

    pub fn with<F>(mut self, kind: ProcessorKind, constructor: F) -> Self
    where
        F: Fn(&ProcessorDeps) -> Box<dyn FrameProcessor> + Send + Sync + 'static,
    {
        self.constructors.insert(kind, Box::new(constructor));
        self
    }

    pub fn create(&self, kind: ProcessorKind, deps: &ProcessorDeps) -> Option<Box<dyn FrameProcessor>> {
        self.constructors.get(&kind).map(|constructor| constructor(deps))
    }
}

/// Session bookkeeping shared by the model-backed processors.
pub(crate) struct BoundModel {
    backend: Arc<dyn ModelBackend>,
    handle: Option<SessionHandle>,
}

impl BoundModel {
    pub(crate) fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend, handle: None }
    }

    pub(crate) fn backend(&self) -> &dyn ModelBackend {
        self.backend.as_ref()
    }

    pub(crate) fn handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    /// Bind `spec` to `device`, releasing whatever was bound before.
    pub(crate) fn bind(&mut self, spec: &ModelSpec, device: Device) -> Result<(), BackendError> {
        if let Some(handle) = &self.handle {
            if handle.model_id == spec.id && handle.device == device && self.backend.is_loaded(handle) {
                return Ok(());
            }
        }
        if let Some(previous) = self.handle.take() {
            self.backend.release(&previous);
        }
        self.handle = Some(self.backend.load(spec, device)?);
        Ok(())
    }
}

/// Make sure the model `id` is on disk, downloading unless disabled.
pub(crate) fn model_available(id: &str, model_dir: &Path, skip_download: bool) -> bool {
    match models::lookup(id).and_then(|spec| models::ensure_asset(spec, model_dir, skip_download)) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(model = id, error = %e, "model unavailable");
            false
        }
    }
}

/// Target faces in `frame` according to the selector mode.
///
/// Reference mode with an empty store selects nothing.
pub(crate) fn select_target_faces(ctx: &RunContext<'_>, frame: &Frame) -> Vec<Face> {
    let faces = match ctx.analyser.detect(frame, &ctx.analyser_options()) {
        Ok(faces) => faces,
        Err(e) => {
            tracing::warn!(error = %e, "face detection failed");
            return Vec::new();
        }
    };
    match ctx.config.face_selector_mode {
        FaceSelectorMode::Reference => {
            find_similar_faces(&faces, ctx.store.faces(), ctx.config.reference_face_distance)
        }
        FaceSelectorMode::One => select_one(&faces, ctx.config.reference_face_position)
            .into_iter()
            .collect(),
        FaceSelectorMode::Many => faces.into_faces(),
    }
}
