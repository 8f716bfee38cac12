//! Test doubles: an in-memory model backend, a scripted face analyser and a
//! processor that only records its lifecycle calls.

#![allow(dead_code)]

use image::{Rgb, RgbImage};
use morph_core::models::ModelSpec;
use morph_core::{
    AnalyserError, AnalyserOptions, BackendError, BoundingBox, Device, Embedding, Face, FaceAnalysis, ModelBackend,
    NamedTensor, SessionHandle, Tensor,
};
use morph_media::Frame;
use morph_pipeline::config::ProcessorKind;
use morph_pipeline::processors::{FrameProcessor, RunContext};
use morph_pipeline::PipelineConfig;
use ndarray::IxDyn;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const BACKGROUND: [u8; 3] = [100, 100, 100];

/// Backend returning canned tensors per model id.
#[derive(Default)]
pub struct FakeBackend {
    pub loads: Mutex<Vec<SessionHandle>>,
    pub released_devices: Mutex<Vec<Device>>,
    pub infers: Mutex<Vec<String>>,
    loaded: Mutex<HashSet<SessionHandle>>,
    /// Unsafe probability reported by `open_nsfw`.
    pub nsfw_probability: Mutex<f32>,
}

impl FakeBackend {
    pub fn infer_count(&self, model_id: &str) -> usize {
        self.infers.lock().unwrap().iter().filter(|id| *id == model_id).count()
    }
}

impl ModelBackend for FakeBackend {
    fn load(&self, model: &ModelSpec, device: Device) -> Result<SessionHandle, BackendError> {
        let handle = SessionHandle::new(&model.id, device);
        self.loads.lock().unwrap().push(handle.clone());
        self.loaded.lock().unwrap().insert(handle.clone());
        Ok(handle)
    }

    fn infer(&self, handle: &SessionHandle, inputs: Vec<Tensor>) -> Result<Vec<NamedTensor>, BackendError> {
        if !self.is_loaded(handle) {
            return Err(BackendError::NotLoaded(handle.clone()));
        }
        self.infers.lock().unwrap().push(handle.model_id.clone());
        let tensor = match handle.model_id.as_str() {
            "inswapper_128" => Tensor::from_elem(IxDyn(&[1, 3, 128, 128]), 1.0),
            "gfpgan_1.4" => Tensor::from_elem(IxDyn(&[1, 3, 512, 512]), 1.0),
            "real_esrgan_x2plus" => {
                let shape = inputs.first().map(|t| t.shape().to_vec()).unwrap_or_default();
                let &[n, c, h, w] = shape.as_slice() else {
                    return Err(BackendError::InferenceFailed(format!("unexpected input shape {shape:?}")));
                };
                Tensor::from_elem(IxDyn(&[n, c, h * 2, w * 2]), 1.0)
            }
            "open_nsfw" => {
                let p = *self.nsfw_probability.lock().unwrap();
                Tensor::from_shape_vec(IxDyn(&[1, 2]), vec![1.0 - p, p])
                    .map_err(|e| BackendError::InferenceFailed(e.to_string()))?
            }
            other => return Err(BackendError::InferenceFailed(format!("no canned output for {other}"))),
        };
        Ok(vec![NamedTensor {
            name: "output".to_string(),
            tensor,
        }])
    }

    fn release(&self, handle: &SessionHandle) {
        self.loaded.lock().unwrap().remove(handle);
    }

    fn release_device(&self, device: Device) {
        self.released_devices.lock().unwrap().push(device);
        self.loaded.lock().unwrap().retain(|h| h.device != device);
    }

    fn is_loaded(&self, handle: &SessionHandle) -> bool {
        self.loaded.lock().unwrap().contains(handle)
    }
}

/// Analyser answering by frame size: every frame of a given size holds the
/// same faces.
#[derive(Default)]
pub struct ScriptedAnalyser {
    faces: HashMap<(u32, u32), Vec<Face>>,
}

impl ScriptedAnalyser {
    pub fn with(mut self, size: (u32, u32), faces: Vec<Face>) -> Self {
        self.faces.insert(size, faces);
        self
    }
}

impl FaceAnalysis for ScriptedAnalyser {
    fn pre_check(&self, _options: &AnalyserOptions) -> bool {
        true
    }

    fn find_faces(&self, frame: &Frame, _options: &AnalyserOptions) -> Result<Vec<Face>, AnalyserError> {
        Ok(self.faces.get(&(frame.width, frame.height)).cloned().unwrap_or_default())
    }
}

/// Square face at (x, y) with landmarks laid out inside the box.
pub fn face_at(x: f32, y: f32, size: f32, score: f32, embedding: Vec<f32>) -> Face {
    let at = |fx: f32, fy: f32| (x + fx * size, y + fy * size);
    Face {
        bbox: BoundingBox { x, y, width: size, height: size },
        landmarks: [at(0.3, 0.4), at(0.7, 0.4), at(0.5, 0.6), at(0.35, 0.8), at(0.65, 0.8)],
        embedding: Embedding::new(embedding).normalized(),
        score,
        attributes: None,
    }
}

pub fn write_png(path: &Path, width: u32, height: u32, rgb: [u8; 3]) {
    RgbImage::from_pixel(width, height, Rgb(rgb)).save(path).unwrap();
}

/// Scratch layout for one test: model dir with placeholder weights, a
/// source and a target image.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub source: PathBuf,
    pub target: PathBuf,
    pub output: PathBuf,
    pub model_dir: PathBuf,
}

pub const SOURCE_SIZE: (u32, u32) = (64, 64);
pub const TARGET_SIZE: (u32, u32) = (256, 128);

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("models");
        std::fs::create_dir_all(&model_dir).unwrap();
        for file in ["inswapper_128.onnx", "gfpgan_1.4.onnx", "open_nsfw.onnx", "real_esrgan_x2plus.onnx"] {
            std::fs::write(model_dir.join(file), b"placeholder").unwrap();
        }

        let source = dir.path().join("source.png");
        let target = dir.path().join("target.png");
        write_png(&source, SOURCE_SIZE.0, SOURCE_SIZE.1, [200, 150, 120]);
        write_png(&target, TARGET_SIZE.0, TARGET_SIZE.1, BACKGROUND);
        let output = dir.path().join("output.png");

        Self {
            source,
            target,
            output,
            model_dir,
            dir,
        }
    }

    pub fn config(&self, processors: Vec<ProcessorKind>) -> PipelineConfig {
        PipelineConfig {
            sources: vec![self.source.clone()],
            target: Some(self.target.clone()),
            output: Some(self.output.clone()),
            processors,
            device: Some(Device::Cpu),
            model_dir: self.model_dir.clone(),
            device_state_path: self.dir.path().join("state/last_device"),
            skip_download: true,
            ..Default::default()
        }
    }
}

/// Two target faces left and right, one source face.
pub fn two_face_analyser() -> ScriptedAnalyser {
    ScriptedAnalyser::default()
        .with(SOURCE_SIZE, vec![face_at(10.0, 10.0, 40.0, 0.95, vec![0.0, 0.0, 1.0])])
        .with(
            TARGET_SIZE,
            vec![
                face_at(150.0, 30.0, 60.0, 0.9, vec![0.0, 1.0, 0.0]),
                face_at(20.0, 30.0, 60.0, 0.8, vec![1.0, 0.0, 0.0]),
            ],
        )
}

/// Lifecycle call, as recorded by [`RecordingProcessor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    PostModels(ProcessorKind, Device),
    Process(ProcessorKind),
    PostProcess(ProcessorKind),
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

/// Processor that records calls and leaves the image untouched.
pub struct RecordingProcessor {
    pub kind: ProcessorKind,
    pub log: CallLog,
    pub succeed: bool,
}

impl FrameProcessor for RecordingProcessor {
    fn kind(&self) -> ProcessorKind {
        self.kind
    }

    fn pre_check(&mut self, _ctx: &RunContext<'_>) -> bool {
        true
    }

    fn pre_process(&mut self, _ctx: &RunContext<'_>) -> bool {
        true
    }

    fn post_models(&mut self, ctx: &RunContext<'_>) -> Result<(), BackendError> {
        self.log.lock().unwrap().push(Call::PostModels(self.kind, ctx.device));
        Ok(())
    }

    fn process_image(&mut self, _ctx: &RunContext<'_>, _sources: &[PathBuf], _input: &Path, _output: &Path) -> bool {
        self.log.lock().unwrap().push(Call::Process(self.kind));
        self.succeed
    }

    fn post_process(&mut self) {
        self.log.lock().unwrap().push(Call::PostProcess(self.kind));
    }
}

pub fn count(log: &CallLog, call: &Call) -> usize {
    log.lock().unwrap().iter().filter(|c| *c == call).count()
}
