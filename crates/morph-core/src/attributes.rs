//! Gender and age estimation from a box-centred 96×96 crop.

use crate::alignment::warp_box;
use crate::backend::{first_output, BackendError, ModelBackend, SessionHandle, Tensor};
use crate::tensor::{frame_to_nchw, ChannelOrder, Normalization};
use crate::types::{BoundingBox, FaceAttributes, Gender};
use morph_media::Frame;

const GENDER_AGE_INPUT_SIZE: usize = 96;
const GENDER_AGE_MARGIN: f32 = 1.5;

pub struct AttributeEstimator<'a> {
    backend: &'a dyn ModelBackend,
    handle: SessionHandle,
}

impl<'a> AttributeEstimator<'a> {
    pub fn new(backend: &'a dyn ModelBackend, handle: SessionHandle) -> Self {
        Self { backend, handle }
    }

    pub fn estimate(&self, frame: &Frame, bbox: &BoundingBox) -> Result<FaceAttributes, BackendError> {
        let (crop, _) = warp_box(frame, bbox, GENDER_AGE_INPUT_SIZE, GENDER_AGE_MARGIN);
        let input = frame_to_nchw(&crop, Normalization::uniform(0.0, 1.0), ChannelOrder::Rgb);
        let output = first_output(self.backend.infer(&self.handle, vec![input])?, &self.handle)?;
        decode(&output).ok_or_else(|| {
            BackendError::InferenceFailed(format!("{}: expected 3 outputs [female, male, age]", self.handle))
        })
    }
}

/// `[female, male, age / 100]` → attributes.
fn decode(output: &Tensor) -> Option<FaceAttributes> {
    let values: Vec<f32> = output.iter().copied().take(3).collect();
    let &[female, male, age] = values.as_slice() else {
        return None;
    };
    let gender = if male > female { Gender::Male } else { Gender::Female };
    let age = (age * 100.0).round().clamp(0.0, 255.0) as u8;
    Some(FaceAttributes { gender, age })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_decode_gender_and_age() {
        let output = Tensor::from_shape_vec(IxDyn(&[1, 3]), vec![0.2, 0.8, 0.347]).unwrap();
        let attrs = decode(&output).unwrap();
        assert_eq!(attrs.gender, Gender::Male);
        assert_eq!(attrs.age, 35);

        let output = Tensor::from_shape_vec(IxDyn(&[1, 3]), vec![0.9, 0.1, 0.08]).unwrap();
        assert_eq!(decode(&output).unwrap().gender, Gender::Female);
    }

    #[test]
    fn test_decode_short_output() {
        let output = Tensor::from_shape_vec(IxDyn(&[2]), vec![0.5, 0.5]).unwrap();
        assert!(decode(&output).is_none());
    }
}
