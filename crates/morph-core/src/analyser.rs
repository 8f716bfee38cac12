//! Face analyser: detection, recognition and attribute estimation over one
//! frame, plus the ordering, filtering and selection rules applied to the
//! resulting [`FaceSet`].

use crate::attributes::AttributeEstimator;
use crate::backend::{BackendError, ModelBackend};
use crate::detector::FaceDetector;
use crate::device::Device;
use crate::models::{self, ModelError};
use crate::recognizer::FaceRecognizer;
use crate::types::{AgeBracket, Embedding, Face, FaceOrder, FaceSet, Gender};
use morph_media::Frame;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub const DETECTOR_MODEL: &str = "retinaface_10g";
pub const RECOGNIZER_MODEL: &str = "arcface_w600k_r50";
pub const ATTRIBUTE_MODEL: &str = "gender_age";

#[derive(Error, Debug)]
pub enum AnalyserError {
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    #[error("model: {0}")]
    Model(#[from] ModelError),
}

/// Detector and selection parameters for one analyser call.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyserOptions {
    pub device: Device,
    /// Square detector input side in pixels.
    pub detector_size: usize,
    /// Faces scoring below this are discarded.
    pub score_threshold: f32,
    pub order: FaceOrder,
    pub age: Option<AgeBracket>,
    pub gender: Option<Gender>,
    pub skip_download: bool,
}

impl Default for AnalyserOptions {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            detector_size: 640,
            score_threshold: 0.5,
            order: FaceOrder::LeftRight,
            age: None,
            gender: None,
            skip_download: false,
        }
    }
}

impl AnalyserOptions {
    fn wants_attributes(&self) -> bool {
        self.age.is_some() || self.gender.is_some()
    }
}

/// Anything that can find faces in a frame.
///
/// Implementors provide [`find_faces`](FaceAnalysis::find_faces); the
/// threshold, ordering and filter rules of [`detect`](FaceAnalysis::detect)
/// are shared.
pub trait FaceAnalysis: Send + Sync {
    /// Whether the models this analyser needs are present (downloading them
    /// when allowed).
    fn pre_check(&self, options: &AnalyserOptions) -> bool;

    /// Raw faces in the frame, in no particular order.
    fn find_faces(&self, frame: &Frame, options: &AnalyserOptions) -> Result<Vec<Face>, AnalyserError>;

    /// Faces at or above the score threshold, filtered and ordered.
    fn detect(&self, frame: &Frame, options: &AnalyserOptions) -> Result<FaceSet, AnalyserError> {
        let faces = self
            .find_faces(frame, options)?
            .into_iter()
            .filter(|face| face.score >= options.score_threshold)
            .collect();
        let faces = filter_faces(order_faces(faces, options.order), options.age, options.gender);
        Ok(FaceSet::new(faces))
    }
}

/// Backend-driven analyser: SCRFD detection, ArcFace embeddings and, when a
/// filter needs them, gender/age estimates.
pub struct FaceAnalyser {
    backend: Arc<dyn ModelBackend>,
    model_dir: PathBuf,
}

impl FaceAnalyser {
    pub fn new(backend: Arc<dyn ModelBackend>, model_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            model_dir: model_dir.into(),
        }
    }

    fn required_models(options: &AnalyserOptions) -> Vec<&'static str> {
        let mut ids = vec![DETECTOR_MODEL, RECOGNIZER_MODEL];
        if options.wants_attributes() {
            ids.push(ATTRIBUTE_MODEL);
        }
        ids
    }
}

impl FaceAnalysis for FaceAnalyser {
    fn pre_check(&self, options: &AnalyserOptions) -> bool {
        Self::required_models(options).into_iter().all(|id| {
            match models::lookup(id).and_then(|spec| models::ensure_asset(spec, &self.model_dir, options.skip_download)) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(model = id, error = %e, "face analyser model unavailable");
                    false
                }
            }
        })
    }

    fn find_faces(&self, frame: &Frame, options: &AnalyserOptions) -> Result<Vec<Face>, AnalyserError> {
        let backend = self.backend.as_ref();
        let detector_handle = backend.load(models::lookup(DETECTOR_MODEL)?, options.device)?;
        let recognizer_handle = backend.load(models::lookup(RECOGNIZER_MODEL)?, options.device)?;
        let estimator = if options.wants_attributes() {
            let handle = backend.load(models::lookup(ATTRIBUTE_MODEL)?, options.device)?;
            Some(AttributeEstimator::new(backend, handle))
        } else {
            None
        };

        let detector = FaceDetector::new(backend, detector_handle, options.detector_size);
        let recognizer = FaceRecognizer::new(backend, recognizer_handle);

        let mut faces = Vec::new();
        for detection in detector.detect(frame, options.score_threshold)? {
            let Some(landmarks) = detection.landmarks else {
                tracing::debug!(score = detection.confidence, "detection without landmarks skipped");
                continue;
            };
            let embedding = recognizer.extract(frame, &landmarks)?;
            let attributes = match &estimator {
                Some(estimator) => Some(estimator.estimate(frame, &detection.bbox)?),
                None => None,
            };
            faces.push(Face {
                bbox: detection.bbox,
                landmarks,
                embedding,
                score: detection.confidence,
                attributes,
            });
        }
        Ok(faces)
    }
}

/// Stable sort by the given policy. Ties keep their incoming order.
pub fn order_faces(mut faces: Vec<Face>, order: FaceOrder) -> Vec<Face> {
    let cmp = |a: f32, b: f32| a.partial_cmp(&b).unwrap_or(Ordering::Equal);
    match order {
        FaceOrder::LeftRight => faces.sort_by(|a, b| cmp(a.bbox.center().0, b.bbox.center().0)),
        FaceOrder::RightLeft => faces.sort_by(|a, b| cmp(b.bbox.center().0, a.bbox.center().0)),
        FaceOrder::TopBottom => faces.sort_by(|a, b| cmp(a.bbox.center().1, b.bbox.center().1)),
        FaceOrder::BottomTop => faces.sort_by(|a, b| cmp(b.bbox.center().1, a.bbox.center().1)),
        FaceOrder::SmallLarge => faces.sort_by(|a, b| cmp(a.bbox.area(), b.bbox.area())),
        FaceOrder::LargeSmall => faces.sort_by(|a, b| cmp(b.bbox.area(), a.bbox.area())),
        FaceOrder::BestWorst => faces.sort_by(|a, b| cmp(b.score, a.score)),
        FaceOrder::WorstBest => faces.sort_by(|a, b| cmp(a.score, b.score)),
    }
    faces
}

/// Keep faces matching the age bracket and gender, preserving order.
///
/// Faces without attribute estimates never match an active filter.
pub fn filter_faces(faces: Vec<Face>, age: Option<AgeBracket>, gender: Option<Gender>) -> Vec<Face> {
    if age.is_none() && gender.is_none() {
        return faces;
    }
    faces
        .into_iter()
        .filter(|face| {
            let Some(attributes) = face.attributes else {
                return false;
            };
            age.map_or(true, |bracket| bracket.contains(attributes.age))
                && gender.map_or(true, |g| g == attributes.gender)
        })
        .collect()
}

/// Face at `position`, or `None` when out of range.
pub fn select_one(faces: &FaceSet, position: usize) -> Option<Face> {
    faces.faces().get(position).cloned()
}

/// Composite identity: geometry of the first face, mean embedding of all.
pub fn average_faces(faces: &[Face]) -> Option<Face> {
    let first = faces.first()?;
    let embedding = Embedding::mean(faces.iter().map(|f| &f.embedding))?;
    Some(Face {
        embedding,
        ..first.clone()
    })
}

/// Detect every frame, take its first face and average the identities.
///
/// Frames without a face are skipped; `None` when no frame has one.
pub fn select_average(
    analysis: &dyn FaceAnalysis,
    frames: &[Frame],
    options: &AnalyserOptions,
) -> Result<Option<Face>, AnalyserError> {
    let mut faces = Vec::with_capacity(frames.len());
    for frame in frames {
        if let Some(face) = select_one(&analysis.detect(frame, options)?, 0) {
            faces.push(face);
        }
    }
    Ok(average_faces(&faces))
}

/// Faces whose embedding distance to any reference is below `max_distance`.
pub fn find_similar_faces<'a>(
    faces: &FaceSet,
    references: impl IntoIterator<Item = &'a Face>,
    max_distance: f32,
) -> Vec<Face> {
    let references: Vec<&Face> = references.into_iter().collect();
    faces
        .iter()
        .filter(|face| {
            references
                .iter()
                .any(|reference| face.embedding.distance(&reference.embedding) < max_distance)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, FaceAttributes};

    fn face(x: f32, y: f32, size: f32, score: f32, embedding: Vec<f32>) -> Face {
        Face {
            bbox: BoundingBox { x, y, width: size, height: size },
            landmarks: [(x, y); 5],
            embedding: Embedding::new(embedding).normalized(),
            score,
            attributes: None,
        }
    }

    fn with_attributes(mut f: Face, gender: Gender, age: u8) -> Face {
        f.attributes = Some(FaceAttributes { gender, age });
        f
    }

    /// Analyser returning fixed faces regardless of the frame.
    struct FixedAnalysis(Vec<Face>);

    impl FaceAnalysis for FixedAnalysis {
        fn pre_check(&self, _: &AnalyserOptions) -> bool {
            true
        }

        fn find_faces(&self, frame: &Frame, _: &AnalyserOptions) -> Result<Vec<Face>, AnalyserError> {
            // An all-black frame has no faces.
            if frame.data.iter().all(|&b| b == 0) {
                return Ok(Vec::new());
            }
            Ok(self.0.clone())
        }
    }

    fn sample() -> Vec<Face> {
        vec![
            face(200.0, 10.0, 20.0, 0.7, vec![1.0, 0.0]),
            face(10.0, 90.0, 50.0, 0.9, vec![0.0, 1.0]),
            face(100.0, 50.0, 30.0, 0.8, vec![1.0, 1.0]),
        ]
    }

    fn xs(faces: &[Face]) -> Vec<f32> {
        faces.iter().map(|f| f.bbox.x).collect()
    }

    #[test]
    fn test_order_policies() {
        assert_eq!(xs(&order_faces(sample(), FaceOrder::LeftRight)), vec![10.0, 100.0, 200.0]);
        assert_eq!(xs(&order_faces(sample(), FaceOrder::RightLeft)), vec![200.0, 100.0, 10.0]);
        assert_eq!(xs(&order_faces(sample(), FaceOrder::TopBottom)), vec![200.0, 100.0, 10.0]);
        assert_eq!(xs(&order_faces(sample(), FaceOrder::BottomTop)), vec![10.0, 100.0, 200.0]);
        assert_eq!(xs(&order_faces(sample(), FaceOrder::SmallLarge)), vec![200.0, 100.0, 10.0]);
        assert_eq!(xs(&order_faces(sample(), FaceOrder::LargeSmall)), vec![10.0, 100.0, 200.0]);
        assert_eq!(xs(&order_faces(sample(), FaceOrder::BestWorst)), vec![10.0, 100.0, 200.0]);
        assert_eq!(xs(&order_faces(sample(), FaceOrder::WorstBest)), vec![200.0, 100.0, 10.0]);
    }

    #[test]
    fn test_order_is_deterministic() {
        let analysis = FixedAnalysis(sample());
        let frame = Frame::filled(8, 8, [1, 1, 1]);
        let options = AnalyserOptions::default();
        for order in FaceOrder::ALL {
            let options = AnalyserOptions { order, ..options.clone() };
            let first = analysis.detect(&frame, &options).unwrap();
            let second = analysis.detect(&frame, &options).unwrap();
            assert_eq!(first, second, "{order}");
        }
    }

    #[test]
    fn test_detect_discards_below_threshold() {
        let analysis = FixedAnalysis(sample());
        let frame = Frame::filled(8, 8, [1, 1, 1]);
        let options = AnalyserOptions { score_threshold: 0.75, ..Default::default() };
        let faces = analysis.detect(&frame, &options).unwrap();
        assert_eq!(xs(faces.faces()), vec![10.0, 100.0]);
    }

    #[test]
    fn test_filter_by_age_and_gender() {
        let faces = vec![
            with_attributes(face(0.0, 0.0, 10.0, 0.9, vec![1.0]), Gender::Female, 8),
            with_attributes(face(1.0, 0.0, 10.0, 0.9, vec![1.0]), Gender::Male, 34),
            with_attributes(face(2.0, 0.0, 10.0, 0.9, vec![1.0]), Gender::Female, 41),
            face(3.0, 0.0, 10.0, 0.9, vec![1.0]),
        ];
        assert_eq!(filter_faces(faces.clone(), None, None).len(), 4);
        assert_eq!(xs(&filter_faces(faces.clone(), Some(AgeBracket::Adult), None)), vec![1.0, 2.0]);
        assert_eq!(xs(&filter_faces(faces.clone(), None, Some(Gender::Female))), vec![0.0, 2.0]);
        assert_eq!(
            xs(&filter_faces(faces, Some(AgeBracket::Adult), Some(Gender::Female))),
            vec![2.0]
        );
    }

    #[test]
    fn test_select_one_bounds() {
        let set = FaceSet::new(order_faces(sample(), FaceOrder::LeftRight));
        for (i, expected) in set.iter().enumerate() {
            assert_eq!(select_one(&set, i).as_ref(), Some(expected));
        }
        assert!(select_one(&set, set.len()).is_none());
        assert!(select_one(&set, 99).is_none());
        assert!(select_one(&FaceSet::default(), 0).is_none());
    }

    #[test]
    fn test_select_average_identical_frames() {
        let analysis = FixedAnalysis(vec![face(5.0, 5.0, 10.0, 0.9, vec![3.0, 4.0])]);
        let frames = vec![Frame::filled(4, 4, [9, 9, 9]); 3];
        let single = select_average(&analysis, &frames[..1], &AnalyserOptions::default())
            .unwrap()
            .unwrap();
        let averaged = select_average(&analysis, &frames, &AnalyserOptions::default())
            .unwrap()
            .unwrap();
        for (a, b) in single.embedding.values.iter().zip(averaged.embedding.values.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(averaged.bbox, single.bbox);
    }

    #[test]
    fn test_select_average_skips_empty_frames() {
        let analysis = FixedAnalysis(vec![face(5.0, 5.0, 10.0, 0.9, vec![1.0, 0.0])]);
        let frames = vec![Frame::filled(4, 4, [0, 0, 0]), Frame::filled(4, 4, [7, 7, 7])];
        let face = select_average(&analysis, &frames, &AnalyserOptions::default()).unwrap();
        assert!(face.is_some());

        let only_empty = vec![Frame::filled(4, 4, [0, 0, 0])];
        assert!(select_average(&analysis, &only_empty, &AnalyserOptions::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_average_faces_mixes_embeddings() {
        let faces = vec![
            face(1.0, 1.0, 10.0, 0.9, vec![1.0, 0.0]),
            face(9.0, 9.0, 10.0, 0.8, vec![0.0, 1.0]),
        ];
        let avg = average_faces(&faces).unwrap();
        assert_eq!(avg.bbox.x, 1.0);
        let expected = 1.0 / 2.0f32.sqrt();
        assert!((avg.embedding.values[0] - expected).abs() < 1e-5);
        assert!((avg.embedding.values[1] - expected).abs() < 1e-5);
        assert!(average_faces(&[]).is_none());
    }

    #[test]
    fn test_find_similar_faces() {
        let set = FaceSet::new(sample());
        let reference = face(0.0, 0.0, 1.0, 1.0, vec![1.0, 0.05]);
        let similar = find_similar_faces(&set, [&reference], 0.1);
        assert_eq!(xs(&similar), vec![200.0]);

        let far = face(0.0, 0.0, 1.0, 1.0, vec![-1.0, 0.0]);
        assert!(find_similar_faces(&set, [&far], 0.5).is_empty());
        assert_eq!(find_similar_faces(&set, [&reference, &far], 2.5).len(), 3);
    }
}
