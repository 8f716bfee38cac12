//! morph-core — face analysis and model plumbing.
//!
//! SCRFD detection, ArcFace embeddings and gender/age estimates run through
//! a [`ModelBackend`]; the ONNX Runtime implementation binds each model to an
//! execution [`Device`]. Also holds landmark alignment, blend masks and the
//! reference [`FaceStore`].

pub mod alignment;
pub mod analyser;
pub mod attributes;
pub mod backend;
pub mod detector;
pub mod device;
pub mod mask;
pub mod models;
pub mod recognizer;
pub mod store;
pub mod tensor;
pub mod types;

pub use analyser::{
    average_faces, filter_faces, find_similar_faces, order_faces, select_average, select_one, AnalyserError,
    AnalyserOptions, FaceAnalyser, FaceAnalysis,
};
pub use backend::{BackendError, ModelBackend, NamedTensor, OrtBackend, SessionHandle, Tensor};
pub use device::Device;
pub use models::{ModelError, ModelRole, ModelSpec};
pub use store::{FaceStore, REFERENCE_ORIGIN};
pub use types::{AgeBracket, BoundingBox, Detection, Embedding, Face, FaceAttributes, FaceOrder, FaceSet, Gender, Landmarks};
