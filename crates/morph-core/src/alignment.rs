//! Face alignment via 4-DOF similarity transform, and the inverse paste-back.
//!
//! Crops are produced by warping the frame so the five detected landmarks
//! land on a normalised template scaled to the crop size. Generated crops
//! go back through the inverse transform, weighted by a [`Mask`].

use crate::mask::Mask;
use crate::types::{BoundingBox, Landmarks};
use morph_media::Frame;

/// 2×3 affine matrix, row-major: `[m00, m01, m02, m10, m11, m12]`.
pub type Affine = [f32; 6];

/// Normalised ArcFace template (recognition crops, 112 px).
pub const ARCFACE_112_V2: Landmarks = [
    (0.341_916_07, 0.461_574_11),
    (0.656_533_93, 0.459_833_93),
    (0.500_225, 0.640_505_36),
    (0.370_975_89, 0.824_691_96),
    (0.631_516_96, 0.823_250_89),
];

/// Normalised ArcFace template for 128 px swap crops.
pub const ARCFACE_128_V2: Landmarks = [
    (0.361_676_56, 0.403_877_34),
    (0.636_967_19, 0.402_354_69),
    (0.500_196_87, 0.560_442_19),
    (0.387_103_91, 0.721_605_47),
    (0.615_077_34, 0.720_344_53),
];

/// Normalised FFHQ template for 512 px restoration crops.
pub const FFHQ_512: Landmarks = [
    (0.376_916_76, 0.468_646_64),
    (0.622_856_97, 0.469_128_13),
    (0.501_238_59, 0.613_319_04),
    (0.393_088_22, 0.725_411),
    (0.611_502_05, 0.724_904_65),
];

/// Template scaled to a square crop of `size` pixels.
pub fn scale_template(template: &Landmarks, size: usize) -> Landmarks {
    let s = size as f32;
    template.map(|(x, y)| (x * s, y * s))
}

/// Estimate a 2×3 similarity transform (4-DOF: scale, rotation, translation)
/// from `src` landmarks to `dst` landmarks using least-squares.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
pub fn estimate_similarity_transform(src: &Landmarks, dst: &Landmarks) -> Affine {
    // For each point pair (sx, sy) -> (dx, dy):
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_4x4(&ata, &atb);
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);

    [a, -b, tx, b, a, ty]
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Invert a 2×3 affine matrix. `None` if singular.
pub fn invert_affine(m: &Affine) -> Option<Affine> {
    let det = m[0] * m[4] - m[1] * m[3];
    if det.abs() < 1e-12 {
        return None;
    }
    let inv = 1.0 / det;
    let a = m[4] * inv;
    let b = -m[1] * inv;
    let d = -m[3] * inv;
    let e = m[0] * inv;
    let c = -(a * m[2] + b * m[5]);
    let f = -(d * m[2] + e * m[5]);
    Some([a, b, c, d, e, f])
}

fn apply(m: &Affine, x: f32, y: f32) -> (f32, f32) {
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
}

/// Bilinear RGB sample with clamped borders.
fn sample_rgb(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    let max_x = frame.width as i64 - 1;
    let max_y = frame.height as i64 - 1;
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let px = |px: i64, py: i64| frame.pixel(px.clamp(0, max_x) as u32, py.clamp(0, max_y) as u32);

    let (tl, tr, bl, br) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));
    let mut out = [0.0f32; 3];
    for c in 0..3 {
        out[c] = f32::from(tl[c]) * (1.0 - fx) * (1.0 - fy)
            + f32::from(tr[c]) * fx * (1.0 - fy)
            + f32::from(bl[c]) * (1.0 - fx) * fy
            + f32::from(br[c]) * fx * fy;
    }
    out
}

/// Apply a 2×3 affine warp (frame → output coordinates) to produce an
/// `out_width` × `out_height` image.
///
/// Uses bilinear interpolation. Pixels mapping outside the frame are black.
pub fn warp_affine(frame: &Frame, matrix: &Affine, out_width: u32, out_height: u32) -> Frame {
    let mut output = Frame::filled(out_width, out_height, [0, 0, 0]);
    let Some(inverse) = invert_affine(matrix) else {
        return output;
    };
    if frame.is_empty() {
        return output;
    }

    for oy in 0..out_height {
        for ox in 0..out_width {
            let (sx, sy) = apply(&inverse, ox as f32, oy as f32);
            if sx < -0.5 || sy < -0.5 || sx > frame.width as f32 - 0.5 || sy > frame.height as f32 - 0.5 {
                continue;
            }
            let rgb = sample_rgb(frame, sx, sy);
            output.put_pixel(ox, oy, rgb.map(|v| v.round().clamp(0.0, 255.0) as u8));
        }
    }

    output
}

/// Warp the face described by `landmarks` onto `template` in a square crop.
///
/// Returns the crop and the frame → crop matrix needed for [`paste_back`].
pub fn warp_face(frame: &Frame, landmarks: &Landmarks, template: &Landmarks, size: usize) -> (Frame, Affine) {
    let matrix = estimate_similarity_transform(landmarks, &scale_template(template, size));
    let crop = warp_affine(frame, &matrix, size as u32, size as u32);
    (crop, matrix)
}

/// Center-and-scale crop around a bounding box, used by attribute models.
///
/// The box's longer side times `margin` fills the crop.
pub fn warp_box(frame: &Frame, bbox: &BoundingBox, size: usize, margin: f32) -> (Frame, Affine) {
    let longest = bbox.width.max(bbox.height).max(1.0) * margin;
    let scale = size as f32 / longest;
    let (cx, cy) = bbox.center();
    let half = size as f32 / 2.0;
    let matrix = [scale, 0.0, half - cx * scale, 0.0, scale, half - cy * scale];
    let crop = warp_affine(frame, &matrix, size as u32, size as u32);
    (crop, matrix)
}

/// Blend a processed crop back into `frame` through the inverse of `matrix`
/// (the frame → crop transform used to cut it).
///
/// Only pixels whose inverse-mapped mask weight is non-zero change.
pub fn paste_back(frame: &mut Frame, crop: &Frame, mask: &Mask, matrix: &Affine) {
    let Some(inverse) = invert_affine(matrix) else {
        return;
    };

    // Bounding rectangle of the crop once mapped into frame space.
    let corners = [
        (0.0, 0.0),
        (crop.width as f32, 0.0),
        (0.0, crop.height as f32),
        (crop.width as f32, crop.height as f32),
    ]
    .map(|(x, y)| apply(&inverse, x, y));
    let min_x = corners.iter().map(|c| c.0).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let min_y = corners.iter().map(|c| c.1).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let max_x = (corners.iter().map(|c| c.0).fold(f32::NEG_INFINITY, f32::max).ceil() as i64)
        .clamp(0, frame.width as i64) as u32;
    let max_y = (corners.iter().map(|c| c.1).fold(f32::NEG_INFINITY, f32::max).ceil() as i64)
        .clamp(0, frame.height as i64) as u32;

    for y in min_y..max_y {
        for x in min_x..max_x {
            let (u, v) = apply(matrix, x as f32, y as f32);
            let weight = mask.sample(u, v).clamp(0.0, 1.0);
            if weight <= 0.0 {
                continue;
            }
            let generated = sample_rgb(crop, u, v);
            let original = frame.pixel(x, y);
            let mut blended = [0u8; 3];
            for c in 0..3 {
                blended[c] = (generated[c] * weight + f32::from(original[c]) * (1.0 - weight))
                    .round()
                    .clamp(0.0, 255.0) as u8;
            }
            frame.put_pixel(x, y, blended);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::box_mask;
    use morph_media::Padding;

    fn reference_112() -> Landmarks {
        scale_template(&ARCFACE_112_V2, 112)
    }

    #[test]
    fn test_template_matches_arcface_reference() {
        let pts = reference_112();
        assert!((pts[0].0 - 38.2946).abs() < 1e-2);
        assert!((pts[0].1 - 51.6963).abs() < 1e-2);
    }

    #[test]
    fn test_identity_transform() {
        let pts = reference_112();
        let m = estimate_similarity_transform(&pts, &pts);

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!((m[4] - 1.0).abs() < 1e-4, "a2 = {}", m[4]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_scaled_transform() {
        let src = reference_112().map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&src, &reference_112());
        assert!((m[0] - 0.5).abs() < 0.05, "a = {}, expected ~0.5", m[0]);
    }

    #[test]
    fn test_invert_affine_roundtrip() {
        let m = [0.8, -0.3, 12.0, 0.3, 0.8, -4.0];
        let inv = invert_affine(&m).unwrap();
        let (x, y) = apply(&m, 10.0, 20.0);
        let (bx, by) = apply(&inv, x, y);
        assert!((bx - 10.0).abs() < 1e-3 && (by - 20.0).abs() < 1e-3);
        assert!(invert_affine(&[0.0; 6]).is_none());
    }

    #[test]
    fn test_warp_output_size() {
        let frame = Frame::filled(64, 48, [128, 128, 128]);
        let out = warp_affine(&frame, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0], 32, 16);
        assert_eq!((out.width, out.height), (32, 16));
        assert_eq!(out.pixel(5, 5), [128, 128, 128]);
    }

    #[test]
    fn test_landmark_roundtrip() {
        // A bright patch at the left eye must land near the template's left eye.
        let mut frame = Frame::filled(200, 200, [0, 0, 0]);
        let src: Landmarks = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        for dy in 0..5 {
            for dx in 0..5 {
                frame.put_pixel(78 + dx, 58 + dy, [255, 255, 255]);
            }
        }

        let (aligned, _) = warp_face(&frame, &src, &ARCFACE_112_V2, 112);
        let reference = reference_112();
        let rx = reference[0].0.round() as u32;
        let ry = reference[0].1.round() as u32;

        let mut max_val = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                max_val = max_val.max(aligned.pixel(x, y)[0]);
            }
        }
        assert!(max_val > 100, "expected bright patch near ({rx}, {ry}), max={max_val}");
    }

    #[test]
    fn test_paste_back_confined_to_crop_region() {
        let mut frame = Frame::filled(100, 100, [0, 0, 0]);
        let matrix = [1.0, 0.0, -30.0, 0.0, 1.0, -30.0]; // crop origin at (30, 30)
        let crop = Frame::filled(20, 20, [255, 255, 255]);
        let mask = box_mask(20, 20, 0.0, Padding::default());

        paste_back(&mut frame, &crop, &mask, &matrix);

        assert_eq!(frame.pixel(40, 40), [255, 255, 255]);
        assert_eq!(frame.pixel(10, 10), [0, 0, 0]);
        assert_eq!(frame.pixel(60, 60), [0, 0, 0]);
        assert_eq!(frame.pixel(30, 30), [0, 0, 0], "masked border stays untouched");
    }

    #[test]
    fn test_warp_box_centers_face() {
        let mut frame = Frame::filled(100, 100, [0, 0, 0]);
        frame.put_pixel(50, 50, [255, 0, 0]);
        let bbox = BoundingBox { x: 40.0, y: 40.0, width: 20.0, height: 20.0 };
        let (crop, _) = warp_box(&frame, &bbox, 40, 1.0);
        // 20 px box → 40 px crop: the center pixel spreads around (40, 40) / 2
        assert!(crop.pixel(20, 20)[0] > 0 || crop.pixel(21, 21)[0] > 0);
    }
}
