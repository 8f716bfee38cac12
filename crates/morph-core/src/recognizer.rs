//! ArcFace face recognizer.
//!
//! Extracts 512-dimensional face embeddings from aligned face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ARCFACE_112_V2};
use crate::backend::{first_output, BackendError, ModelBackend, SessionHandle};
use crate::tensor::{frame_to_nchw, ChannelOrder, Normalization};
use crate::types::{Embedding, Landmarks};
use morph_media::Frame;

const ARCFACE_INPUT_SIZE: usize = 112;
// ArcFace uses symmetric normalisation, unlike SCRFD's 128.0 divisor.
const ARCFACE_NORMALIZATION: Normalization = Normalization::uniform(127.5, 127.5);
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// ArcFace-based face recognizer bound to one backend session.
pub struct FaceRecognizer<'a> {
    backend: &'a dyn ModelBackend,
    handle: SessionHandle,
}

impl<'a> FaceRecognizer<'a> {
    pub fn new(backend: &'a dyn ModelBackend, handle: SessionHandle) -> Self {
        Self { backend, handle }
    }

    /// Extract an L2-normalised embedding for the face at `landmarks`.
    ///
    /// The face is aligned to the canonical 112×112 position first.
    pub fn extract(&self, frame: &Frame, landmarks: &Landmarks) -> Result<Embedding, BackendError> {
        let (aligned, _) = alignment::warp_face(frame, landmarks, &ARCFACE_112_V2, ARCFACE_INPUT_SIZE);
        let input = Self::preprocess(&aligned);

        let outputs = self.backend.infer(&self.handle, vec![input])?;
        let raw: Vec<f32> = first_output(outputs, &self.handle)?.iter().copied().collect();

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(BackendError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: raw,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        }
        .normalized())
    }

    fn preprocess(aligned: &Frame) -> crate::backend::Tensor {
        frame_to_nchw(aligned, ARCFACE_NORMALIZATION, ChannelOrder::Rgb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = Frame::filled(112, 112, [128, 128, 128]);
        let tensor = FaceRecognizer::preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let aligned = Frame::filled(112, 112, [128, 128, 128]);
        let tensor = FaceRecognizer::preprocess(&aligned);
        // 128 - 127.5 = 0.5, / 127.5 ≈ 0.00392
        let val = tensor[IxDyn(&[0, 0, 0, 0])];
        assert!((val - 0.5 / 127.5).abs() < 1e-6, "got {val}");
    }

    #[test]
    fn test_preprocess_extremes() {
        let black = FaceRecognizer::preprocess(&Frame::filled(112, 112, [0, 0, 0]));
        let white = FaceRecognizer::preprocess(&Frame::filled(112, 112, [255, 255, 255]));
        assert!((black[IxDyn(&[0, 0, 0, 0])] + 1.0).abs() < 1e-6);
        assert!((white[IxDyn(&[0, 0, 0, 0])] - 1.0).abs() < 1e-6);
    }
}
