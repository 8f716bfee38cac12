//! Pipeline driver.
//!
//! One run walks `INIT → REFERENCE_BOOTSTRAP → PROCESSING → VALIDATED`, with
//! `ABORTED` reachable from every state. Stages run strictly one after the
//! other on the calling thread. The orchestrator outlives single runs: it
//! keeps each processor and its bound device so a device change between runs
//! triggers exactly one `post_models` per active processor.

use crate::config::{FaceSelectorMode, PipelineConfig, ProcessorKind};
use crate::ledger::DeviceLedger;
use crate::processors::{
    FrameProcessor, ProcessorDeps, ProcessorRegistry, ProcessorState, RunContext, Screening,
};
use crate::resources;
use morph_core::{select_one, Device, FaceAnalyser, FaceAnalysis, FaceStore, ModelBackend, OrtBackend, REFERENCE_ORIGIN};
use morph_media::{is_image, is_valid_image, normalize_output_path, read_image};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Cooperative cancellation flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    ReferenceBootstrap,
    Processing,
    Validated,
    Aborted,
}

/// Why a run ended in [`RunState::Aborted`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    InvalidConfig(String),
    MissingTarget,
    InvalidTarget(PathBuf),
    InvalidOutput,
    UnknownProcessor(ProcessorKind),
    AssetUnavailable { stage: ProcessorKind },
    Rejected { stage: ProcessorKind },
    ModelLoad { stage: ProcessorKind, error: String },
    UnsafeContent { stage: ProcessorKind },
    StageFailed { stage: ProcessorKind },
    Cancelled,
    Io(String),
    ValidationFailed(PathBuf),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::InvalidConfig(e) => write!(f, "invalid configuration: {e}"),
            AbortReason::MissingTarget => write!(f, "no target image given"),
            AbortReason::InvalidTarget(path) => write!(f, "target is not a readable image: {}", path.display()),
            AbortReason::InvalidOutput => write!(f, "output path cannot be resolved"),
            AbortReason::UnknownProcessor(kind) => write!(f, "{kind}: no such processor registered"),
            AbortReason::AssetUnavailable { stage } => write!(f, "{stage}: model assets unavailable"),
            AbortReason::Rejected { stage } => write!(f, "{stage}: configuration rejected"),
            AbortReason::ModelLoad { stage, error } => write!(f, "{stage}: model load failed: {error}"),
            AbortReason::UnsafeContent { stage } => write!(f, "{stage}: target flagged as unsafe"),
            AbortReason::StageFailed { stage } => write!(f, "{stage}: processing failed"),
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::Io(e) => write!(f, "io: {e}"),
            AbortReason::ValidationFailed(path) => write!(f, "output is not a valid image: {}", path.display()),
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Terminal state: `Validated` or `Aborted`.
    pub state: RunState,
    /// State the run was in when it aborted.
    pub aborted_in: Option<RunState>,
    pub reason: Option<AbortReason>,
    pub output: Option<PathBuf>,
    pub device: Device,
    /// Processors whose transform succeeded, in order.
    pub applied: Vec<ProcessorKind>,
}

impl RunReport {
    fn new(device: Device) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: RunState::Init,
            aborted_in: None,
            reason: None,
            output: None,
            device,
            applied: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Validated
    }
}

struct Slot {
    processor: Box<dyn FrameProcessor>,
    state: ProcessorState,
}

pub struct Orchestrator {
    deps: ProcessorDeps,
    analyser: Arc<dyn FaceAnalysis>,
    registry: ProcessorRegistry,
    slots: Vec<Slot>,
    store: FaceStore,
    last_device: Option<Device>,
    ledger: Option<DeviceLedger>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn ModelBackend>, analyser: Arc<dyn FaceAnalysis>, registry: ProcessorRegistry) -> Self {
        Self {
            deps: ProcessorDeps { backend },
            analyser,
            registry,
            slots: Vec::new(),
            store: FaceStore::new(),
            last_device: None,
            ledger: None,
        }
    }

    /// ONNX Runtime backend, backend-driven analyser and the built-in
    /// processors, with the device ledger at the configured path.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let backend: Arc<dyn ModelBackend> =
            Arc::new(OrtBackend::new(&config.model_dir, config.execution_thread_count));
        let analyser = Arc::new(FaceAnalyser::new(backend.clone(), &config.model_dir));
        Self::new(backend, analyser, ProcessorRegistry::builtin())
            .with_ledger(DeviceLedger::new(&config.device_state_path))
    }

    pub fn with_ledger(mut self, ledger: DeviceLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn store(&self) -> &FaceStore {
        &self.store
    }

    pub fn last_device(&self) -> Option<Device> {
        self.last_device
    }

    pub fn processor_state(&self, kind: ProcessorKind) -> Option<&ProcessorState> {
        self.slots.iter().map(|s| &s.state).find(|s| s.kind == kind)
    }

    /// Execute one top-level run.
    pub fn run(&mut self, config: &PipelineConfig, cancel: &CancelToken) -> RunReport {
        let device = self.resolve_device(config);
        let mut report = RunReport::new(device);
        let span = tracing::info_span!("run", id = %report.run_id);
        let _enter = span.enter();

        tracing::info!(
            %device,
            processors = ?config.processors,
            mode = ?config.face_selector_mode,
            "run started"
        );

        match self.execute(config, cancel, &mut report) {
            Ok(()) => {
                tracing::info!(output = ?report.output, applied = ?report.applied, "run validated");
            }
            Err(reason) => {
                tracing::warn!(state = ?report.state, %reason, "run aborted");
                report.aborted_in = Some(report.state);
                report.state = RunState::Aborted;
                report.reason = Some(reason);
            }
        }
        report
    }

    fn resolve_device(&self, config: &PipelineConfig) -> Device {
        config
            .device
            .or_else(|| self.ledger.as_ref().and_then(DeviceLedger::load))
            .unwrap_or_default()
    }

    fn execute(&mut self, config: &PipelineConfig, cancel: &CancelToken, report: &mut RunReport) -> Result<(), AbortReason> {
        // INIT
        config
            .validate()
            .map_err(|e| AbortReason::InvalidConfig(e.to_string()))?;
        let target = config.target.clone().ok_or(AbortReason::MissingTarget)?;
        if !is_image(&target) {
            return Err(AbortReason::InvalidTarget(target));
        }
        let output = normalize_output_path(config.sources.first().map(PathBuf::as_path), Some(target.as_path()), config.output.as_deref())
            .ok_or(AbortReason::InvalidOutput)?;
        report.output = Some(output.clone());

        let device = report.device;
        self.observe_device(device);
        self.store.clear();
        if let Err(e) = resources::limit_memory(config.max_memory) {
            tracing::warn!(error = %e, "memory limit not applied");
        }

        let active = self.activate(&config.processors)?;

        // Gates run before anything is written.
        for &idx in &active {
            let ctx = RunContext {
                config,
                analyser: self.analyser.as_ref(),
                store: &self.store,
                device,
            };
            let slot = &mut self.slots[idx];
            let stage = slot.state.kind;
            if !slot.processor.pre_check(&ctx) {
                return Err(AbortReason::AssetUnavailable { stage });
            }
            if !slot.processor.pre_process(&ctx) {
                return Err(AbortReason::Rejected { stage });
            }
        }

        for &idx in &active {
            let ctx = RunContext {
                config,
                analyser: self.analyser.as_ref(),
                store: &self.store,
                device,
            };
            let slot = &mut self.slots[idx];
            ensure_bound(slot, &ctx)?;
            if slot.processor.screen_target(&ctx, &target) == Screening::Flagged {
                return Err(AbortReason::UnsafeContent { stage: slot.state.kind });
            }
        }
        check_cancel(cancel)?;

        // REFERENCE_BOOTSTRAP
        if config.face_selector_mode == FaceSelectorMode::Reference {
            report.state = RunState::ReferenceBootstrap;
            self.bootstrap_references(config, &target, &active, device, cancel)?;
        }

        // PROCESSING
        report.state = RunState::Processing;
        copy_atomic(&target, &output).map_err(|e| AbortReason::Io(e.to_string()))?;
        tracing::debug!(from = %target.display(), to = %output.display(), "target copied to output");

        for &idx in &active {
            check_cancel(cancel)?;
            let ctx = RunContext {
                config,
                analyser: self.analyser.as_ref(),
                store: &self.store,
                device,
            };
            let slot = &mut self.slots[idx];
            let stage = slot.state.kind;
            ensure_bound(slot, &ctx)?;

            tracing::info!(%stage, "processing");
            let ok = slot.processor.process_image(&ctx, &config.sources, &output, &output);
            slot.processor.post_process();
            if !ok {
                return Err(AbortReason::StageFailed { stage });
            }
            report.applied.push(stage);
        }

        // VALIDATED
        if !is_valid_image(&output) {
            return Err(AbortReason::ValidationFailed(output));
        }
        report.state = RunState::Validated;
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.save(device) {
                tracing::warn!(path = %ledger.path().display(), error = %e, "device state not saved");
            }
        }
        Ok(())
    }

    /// Global device bookkeeping: drop every session of the previous device
    /// when it changes. Slots bound there, active or not, lose their binding.
    fn observe_device(&mut self, device: Device) {
        match self.last_device {
            Some(previous) if previous != device => {
                tracing::info!(from = %previous, to = %device, "execution device changed");
                self.deps.backend.release_device(previous);
                for slot in &mut self.slots {
                    if slot.state.last_bound_device == Some(previous) {
                        slot.state.last_bound_device = None;
                    }
                }
            }
            _ => {}
        }
        self.last_device = Some(device);
    }

    /// Resolve the configured processor list to slot indices, creating
    /// processors not seen before. Slots not listed become inactive.
    fn activate(&mut self, kinds: &[ProcessorKind]) -> Result<Vec<usize>, AbortReason> {
        for slot in &mut self.slots {
            slot.state.active = false;
        }
        let mut active = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            let idx = match self.slots.iter().position(|s| s.state.kind == kind) {
                Some(idx) => idx,
                None => {
                    let processor = self
                        .registry
                        .create(kind, &self.deps)
                        .ok_or(AbortReason::UnknownProcessor(kind))?;
                    self.slots.push(Slot {
                        processor,
                        state: ProcessorState::new(kind),
                    });
                    self.slots.len() - 1
                }
            };
            self.slots[idx].state.active = true;
            active.push(idx);
        }
        Ok(active)
    }

    /// Store the target face at the reference position as `origin`, then let
    /// each processor derive its own reference from what it would produce.
    ///
    /// Positions without a detectable face store nothing.
    fn bootstrap_references(
        &mut self,
        config: &PipelineConfig,
        target: &Path,
        active: &[usize],
        device: Device,
        cancel: &CancelToken,
    ) -> Result<(), AbortReason> {
        let mut frame = read_image(target).ok_or_else(|| AbortReason::InvalidTarget(target.to_path_buf()))?;
        let options = config.analyser_options(device);
        let position = config.reference_face_position;

        let detect_reference = |analyser: &dyn FaceAnalysis, frame: &morph_media::Frame| match analyser.detect(frame, &options) {
            Ok(faces) => select_one(&faces, position),
            Err(e) => {
                tracing::warn!(error = %e, "reference detection failed");
                None
            }
        };

        let Some(mut reference) = detect_reference(self.analyser.as_ref(), &frame) else {
            tracing::warn!(position, "no reference face at position, none stored");
            return Ok(());
        };
        self.store.put(REFERENCE_ORIGIN, reference.clone());
        tracing::debug!(position, score = reference.score, "origin reference stored");

        for &idx in active {
            check_cancel(cancel)?;
            let derived = {
                let ctx = RunContext {
                    config,
                    analyser: self.analyser.as_ref(),
                    store: &self.store,
                    device,
                };
                let slot = &mut self.slots[idx];
                ensure_bound(slot, &ctx)?;
                slot.processor.reference_frame(&ctx, &reference, &frame)
            };
            let Some(derived) = derived else {
                continue;
            };
            let stage = self.slots[idx].state.kind;
            match detect_reference(self.analyser.as_ref(), &derived) {
                Some(face) => {
                    self.store.put(stage.as_str(), face.clone());
                    tracing::debug!(%stage, "processor reference stored");
                    reference = face;
                    frame = derived;
                }
                None => {
                    tracing::info!(%stage, "no face in processor reference frame, none stored");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Call `post_models` when the processor has not yet bound `ctx.device`.
fn ensure_bound(slot: &mut Slot, ctx: &RunContext<'_>) -> Result<(), AbortReason> {
    if !slot.state.needs_reload(ctx.device) {
        return Ok(());
    }
    let stage = slot.state.kind;
    slot.processor
        .post_models(ctx)
        .map_err(|e| AbortReason::ModelLoad { stage, error: e.to_string() })?;
    tracing::info!(%stage, from = ?slot.state.last_bound_device, to = %ctx.device, "processor bound to device");
    slot.state.last_bound_device = Some(ctx.device);
    Ok(())
}

fn check_cancel(cancel: &CancelToken) -> Result<(), AbortReason> {
    if cancel.is_cancelled() {
        Err(AbortReason::Cancelled)
    } else {
        Ok(())
    }
}

/// Copy `from` to `to` through a temp file in the destination directory.
fn copy_atomic(from: &Path, to: &Path) -> std::io::Result<()> {
    let directory = match to.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(directory)?;
    let mut source = std::fs::File::open(from)?;
    std::io::copy(&mut source, staged.as_file_mut())?;
    staged.persist(to).map_err(|e| e.error)?;
    Ok(())
}
