//! Model backend: device-bound inference sessions.
//!
//! A backend turns `(model id, device)` into a session handle and runs
//! inference on it. [`OrtBackend`] implements this with ONNX Runtime and keeps
//! one session per key; session creation is serialised per key so two
//! callers never load the same model onto the same device twice.

use crate::device::Device;
use crate::models::{ModelError, ModelSpec};
use ndarray::{ArrayD, IxDyn};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider, DirectMLExecutionProvider,
    ExecutionProviderDispatch, OpenVINOExecutionProvider, ROCmExecutionProvider, TensorRTExecutionProvider,
};
use ort::session::{Session, SessionInputValue};
use ort::value::TensorRef;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Dense f32 tensor exchanged with a backend.
pub type Tensor = ArrayD<f32>;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("no session loaded for {0}")]
    NotLoaded(SessionHandle),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model: {0}")]
    Model(#[from] ModelError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Key of a loaded session: which model, bound to which device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub model_id: String,
    pub device: Device,
}

impl SessionHandle {
    pub fn new(model_id: &str, device: Device) -> Self {
        Self {
            model_id: model_id.to_string(),
            device,
        }
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.model_id, self.device)
    }
}

/// One named model output.
#[derive(Debug, Clone)]
pub struct NamedTensor {
    pub name: String,
    pub tensor: Tensor,
}

/// Uniform inference interface over opaque model networks.
pub trait ModelBackend: Send + Sync {
    /// Bind `model` to `device`. Idempotent per `(model id, device)` once the
    /// file exists on disk.
    fn load(&self, model: &ModelSpec, device: Device) -> Result<SessionHandle, BackendError>;

    /// Run one blocking inference call. Inputs are positional.
    fn infer(&self, handle: &SessionHandle, inputs: Vec<Tensor>) -> Result<Vec<NamedTensor>, BackendError>;

    /// Drop the session behind `handle`, if any.
    fn release(&self, handle: &SessionHandle);

    /// Drop every session bound to `device`.
    fn release_device(&self, device: Device);

    fn is_loaded(&self, handle: &SessionHandle) -> bool;
}

/// ONNX Runtime backend reading models from a directory.
pub struct OrtBackend {
    model_dir: PathBuf,
    intra_threads: usize,
    sessions: Mutex<HashMap<SessionHandle, Arc<Mutex<Session>>>>,
    load_gates: Mutex<HashMap<SessionHandle, Arc<Mutex<()>>>>,
}

impl OrtBackend {
    pub fn new(model_dir: impl Into<PathBuf>, intra_threads: usize) -> Self {
        Self {
            model_dir: model_dir.into(),
            intra_threads: intra_threads.max(1),
            sessions: Mutex::new(HashMap::new()),
            load_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    fn gate(&self, handle: &SessionHandle) -> Arc<Mutex<()>> {
        lock(&self.load_gates)
            .entry(handle.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn session(&self, handle: &SessionHandle) -> Option<Arc<Mutex<Session>>> {
        lock(&self.sessions).get(handle).cloned()
    }
}

impl ModelBackend for OrtBackend {
    fn load(&self, model: &ModelSpec, device: Device) -> Result<SessionHandle, BackendError> {
        let handle = SessionHandle::new(&model.id, device);
        let gate = self.gate(&handle);
        let _loading = lock(&gate);

        if self.session(&handle).is_some() {
            return Ok(handle);
        }

        let path = model.path_in(&self.model_dir);
        if !path.exists() {
            return Err(BackendError::ModelNotFound(path));
        }

        let session = Session::builder()?
            .with_intra_threads(self.intra_threads)?
            .with_execution_providers(execution_providers(device))?
            .commit_from_file(&path)?;

        tracing::info!(
            model = %model.id,
            %device,
            inputs = ?session.inputs().iter().map(|i| i.name().to_string()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name().to_string()).collect::<Vec<_>>(),
            "loaded model session"
        );

        lock(&self.sessions).insert(handle.clone(), Arc::new(Mutex::new(session)));
        Ok(handle)
    }

    fn infer(&self, handle: &SessionHandle, inputs: Vec<Tensor>) -> Result<Vec<NamedTensor>, BackendError> {
        let session = self
            .session(handle)
            .ok_or_else(|| BackendError::NotLoaded(handle.clone()))?;
        let mut session = lock(&session);

        let input_names: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        if input_names.len() != inputs.len() {
            return Err(BackendError::InferenceFailed(format!(
                "{handle}: model takes {} inputs, got {}",
                input_names.len(),
                inputs.len()
            )));
        }

        let mut feeds: Vec<(String, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len());
        for (name, tensor) in input_names.into_iter().zip(inputs.iter()) {
            feeds.push((name, TensorRef::from_array_view(tensor.view())?.into()));
        }

        let outputs = session.run(feeds)?;

        let mut results = Vec::with_capacity(output_names.len());
        for (idx, name) in output_names.into_iter().enumerate() {
            let (shape, data) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::InferenceFailed(format!("{handle} output {name}: {e}")))?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            let tensor = ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec())
                .map_err(|e| BackendError::InferenceFailed(format!("{handle} output {name}: {e}")))?;
            results.push(NamedTensor { name, tensor });
        }

        Ok(results)
    }

    fn release(&self, handle: &SessionHandle) {
        if lock(&self.sessions).remove(handle).is_some() {
            tracing::debug!(%handle, "released model session");
        }
    }

    fn release_device(&self, device: Device) {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|handle, _| handle.device != device);
        let released = before - sessions.len();
        if released > 0 {
            tracing::debug!(%device, released, "released device sessions");
        }
    }

    fn is_loaded(&self, handle: &SessionHandle) -> bool {
        self.session(handle).is_some()
    }
}

/// Provider chain for a device. CPU is always the final fallback.
fn execution_providers(device: Device) -> Vec<ExecutionProviderDispatch> {
    let mut providers = match device {
        Device::Cpu => Vec::new(),
        Device::Cuda => vec![CUDAExecutionProvider::default().build()],
        Device::TensorRt => vec![
            TensorRTExecutionProvider::default().build(),
            CUDAExecutionProvider::default().build(),
        ],
        Device::Rocm => vec![ROCmExecutionProvider::default().build()],
        Device::DirectMl => vec![DirectMLExecutionProvider::default().build()],
        Device::OpenVino => vec![OpenVINOExecutionProvider::default().build()],
        Device::CoreMl => vec![CoreMLExecutionProvider::default().build()],
    };
    providers.push(CPUExecutionProvider::default().build());
    providers
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// First output of an inference result, or an error naming the model.
pub fn first_output(outputs: Vec<NamedTensor>, handle: &SessionHandle) -> Result<Tensor, BackendError> {
    outputs
        .into_iter()
        .next()
        .map(|o| o.tensor)
        .ok_or_else(|| BackendError::InferenceFailed(format!("{handle}: model produced no outputs")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_is_last_provider() {
        for device in Device::ALL {
            let providers = execution_providers(device);
            assert!(!providers.is_empty());
        }
        assert_eq!(execution_providers(Device::Cpu).len(), 1);
        assert_eq!(execution_providers(Device::TensorRt).len(), 3);
    }

    #[test]
    fn test_load_missing_model_errors() {
        let dir = tempfile::tempdir().unwrap();
        let backend = OrtBackend::new(dir.path(), 1);
        let spec = crate::models::lookup("retinaface_10g").unwrap();
        let result = backend.load(spec, Device::Cpu);
        assert!(matches!(result, Err(BackendError::ModelNotFound(_))));
        assert!(!backend.is_loaded(&SessionHandle::new("retinaface_10g", Device::Cpu)));
    }

    #[test]
    fn test_infer_without_load_errors() {
        let backend = OrtBackend::new("/nonexistent", 1);
        let handle = SessionHandle::new("open_nsfw", Device::Cpu);
        let result = backend.infer(&handle, vec![]);
        assert!(matches!(result, Err(BackendError::NotLoaded(_))));
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(SessionHandle::new("gfpgan_1.4", Device::Cuda).to_string(), "gfpgan_1.4@cuda");
    }

    #[test]
    fn test_first_output_empty_errors() {
        let handle = SessionHandle::new("x", Device::Cpu);
        assert!(first_output(Vec::new(), &handle).is_err());
    }
}
