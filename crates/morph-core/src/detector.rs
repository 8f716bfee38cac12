//! SCRFD (RetinaFace-style) face detector on top of a [`ModelBackend`].
//!
//! 3-stride anchor-free decoding with letterboxed input and NMS
//! post-processing. The detector input is square; its side is configurable.

use crate::backend::{BackendError, ModelBackend, NamedTensor, SessionHandle};
use crate::tensor::{frame_to_nchw, ChannelOrder, Normalization};
use crate::types::{BoundingBox, Detection};
use morph_media::Frame;

const SCRFD_NORMALIZATION: Normalization = Normalization::uniform(127.5, 128.0);
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Supported square detector input sizes.
pub const DETECTOR_SIZES: [usize; 7] = [160, 320, 480, 512, 640, 768, 1024];

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector bound to one backend session.
pub struct FaceDetector<'a> {
    backend: &'a dyn ModelBackend,
    handle: SessionHandle,
    input_size: usize,
}

impl<'a> FaceDetector<'a> {
    pub fn new(backend: &'a dyn ModelBackend, handle: SessionHandle, input_size: usize) -> Self {
        Self {
            backend,
            handle,
            input_size,
        }
    }

    /// Detect faces, keeping scores at or above `score_threshold`, sorted by
    /// descending confidence.
    pub fn detect(&self, frame: &Frame, score_threshold: f32) -> Result<Vec<Detection>, BackendError> {
        if frame.is_empty() {
            return Ok(Vec::new());
        }
        let (canvas, letterbox) = letterbox(frame, self.input_size);
        let input = frame_to_nchw(&canvas, SCRFD_NORMALIZATION, ChannelOrder::Bgr);

        let outputs = self.backend.infer(&self.handle, vec![input])?;
        if outputs.len() < 9 {
            return Err(BackendError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                outputs.len()
            )));
        }

        let names: Vec<String> = outputs.iter().map(|o| o.name.clone()).collect();
        let stride_indices = discover_output_indices(&names);

        let mut all_detections = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = stride_indices[stride_pos];
            let flat = |o: &NamedTensor| o.tensor.iter().copied().collect::<Vec<f32>>();

            let dets = decode_stride(
                &flat(&outputs[score_idx]),
                &flat(&outputs[bbox_idx]),
                &flat(&outputs[kps_idx]),
                stride,
                self.input_size,
                &letterbox,
                score_threshold,
            );
            all_detections.extend(dets);
        }

        let result = nms(all_detections, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = result.len(), size = self.input_size, "SCRFD detection");
        Ok(result)
    }
}

/// Fit `frame` into a centred `size`×`size` canvas padded with mid-grey
/// (which normalises to ~0).
fn letterbox(frame: &Frame, size: usize) -> (Frame, LetterboxInfo) {
    let scale = (size as f32 / frame.width as f32).min(size as f32 / frame.height as f32);
    let new_w = ((frame.width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((frame.height as f32 * scale).round() as usize).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let resized = frame.resize(new_w as u32, new_h as u32);
    let mut canvas = Frame::filled(size as u32, size as u32, [128, 128, 128]);
    let (ox, oy) = (pad_x.floor() as u32, pad_y.floor() as u32);
    for y in 0..resized.height {
        for x in 0..resized.width {
            canvas.put_pixel(ox + x, oy + y, resized.pixel(x, y));
        }
    }

    (
        canvas,
        LetterboxInfo {
            scale,
            pad_x: ox as f32,
            pad_y: oy as f32,
        },
    )
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports either name tensors ("score_8", "bbox_16", ...) or use
/// generic numeric names. Unrecognised names fall back to the standard
/// positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0, 0, 0); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => named[slot] = (s, b, k),
            _ => {
                tracing::trace!(?names, "SCRFD: output names not recognised, using positional mapping");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    named
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let unmap = |x: f32, y: f32| ((x - letterbox.pad_x) / letterbox.scale, (y - letterbox.pad_y) / letterbox.scale);

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score < threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * stride as f32;
        let anchor_cy = (anchor_idx / grid) as f32 * stride as f32;

        // [x1_offset, y1_offset, x2_offset, y2_offset] * stride
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let (x1, y1) = unmap(
            anchor_cx - bboxes[bbox_off] * stride as f32,
            anchor_cy - bboxes[bbox_off + 1] * stride as f32,
        );
        let (x2, y2) = unmap(
            anchor_cx + bboxes[bbox_off + 2] * stride as f32,
            anchor_cy + bboxes[bbox_off + 3] * stride as f32,
        );

        let kps_off = idx * 10;
        let landmarks = (kps_off + 9 < kps.len()).then(|| {
            std::array::from_fn(|i| {
                unmap(
                    anchor_cx + kps[kps_off + i * 2] * stride as f32,
                    anchor_cy + kps[kps_off + i * 2 + 1] * stride as f32,
                )
            })
        });

        detections.push(Detection {
            bbox: BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i].bbox, &detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_det(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection {
            bbox: BoundingBox { x, y, width: w, height: h },
            confidence: conf,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_det(0.0, 0.0, 100.0, 100.0, 1.0).bbox;
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_det(0.0, 0.0, 10.0, 10.0, 1.0).bbox;
        let b = make_det(20.0, 20.0, 10.0, 10.0, 1.0).bbox;
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_det(0.0, 0.0, 10.0, 10.0, 1.0).bbox;
        let b = make_det(5.0, 0.0, 10.0, 10.0, 1.0).bbox;
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_det(0.0, 0.0, 100.0, 100.0, 0.9),
            make_det(5.0, 5.0, 100.0, 100.0, 0.8),
            make_det(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_coordinate_roundtrip() {
        let frame = Frame::filled(320, 240, [10, 10, 10]);
        let (canvas, letterbox) = letterbox(&frame, 640);
        assert_eq!((canvas.width, canvas.height), (640, 640));
        assert!((letterbox.scale - 2.0).abs() < 1e-6);
        assert_eq!(letterbox.pad_x, 0.0);
        assert_eq!(letterbox.pad_y, 80.0);
        assert_eq!(canvas.pixel(0, 0), [128, 128, 128]);
        assert_eq!(canvas.pixel(320, 320), [10, 10, 10]);

        let (orig_x, orig_y) = (100.0f32, 50.0f32);
        let recovered_x = (orig_x * letterbox.scale + letterbox.pad_x - letterbox.pad_x) / letterbox.scale;
        let recovered_y = (orig_y * letterbox.scale + letterbox.pad_y - letterbox.pad_y) / letterbox.scale;
        assert!((recovered_x - orig_x).abs() < 0.1);
        assert!((recovered_y - orig_y).abs() < 0.1);
    }

    #[test]
    fn test_decode_stride_threshold_is_inclusive() {
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let anchors = (160 / 32) * (160 / 32) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; anchors];
        scores[0] = 0.5;
        scores[2] = 0.49;
        let bboxes = vec![1.0; anchors * 4];
        let kps = vec![0.0; anchors * 10];

        let dets = decode_stride(&scores, &bboxes, &kps, 32, 160, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox.x, -32.0);
        assert_eq!(dets[0].bbox.width, 64.0);
        assert_eq!(dets[0].landmarks.map(|l| l[0]), Some((0.0, 0.0)));
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8",  "bbox_16",  "bbox_32",
            "kps_8",   "kps_16",   "kps_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices[0], (2, 0, 1));
        assert_eq!(indices[1], (5, 3, 4));
        assert_eq!(indices[2], (8, 6, 7));
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }
}
