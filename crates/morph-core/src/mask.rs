//! Soft box masks for blending generated face crops back into a frame.

use image::{ImageBuffer, Luma};
use morph_media::Padding;

/// Single-channel weights in [0, 1], row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Mask {
    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Bilinear sample; 0 outside the mask.
    pub fn sample(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor() as i64;
        let y0 = y.floor() as i64;
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;
        let at = |px: i64, py: i64| -> f32 {
            if px >= 0 && py >= 0 && (px as usize) < self.width && (py as usize) < self.height {
                self.get(px as usize, py as usize)
            } else {
                0.0
            }
        };
        at(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + at(x0 + 1, y0) * fx * (1.0 - fy)
            + at(x0, y0 + 1) * (1.0 - fx) * fy
            + at(x0 + 1, y0 + 1) * fx * fy
    }
}

/// Box mask with feathered edges.
///
/// `blur` in [0, 1] scales the feather width against the crop size; each
/// padding edge (percent of crop size) zeroes a band on that side. The zeroed
/// band is never narrower than half the blur amount so the feather has room.
pub fn box_mask(width: usize, height: usize, blur: f32, padding: Padding) -> Mask {
    let blur_amount = (width as f32 * 0.5 * blur.clamp(0.0, 1.0)) as usize;
    let blur_area = (blur_amount / 2).max(1);

    let band = |percent: u32, extent: usize| -> usize {
        blur_area.max(extent * percent.min(100) as usize / 100).min(extent)
    };
    let top = band(padding.top, height);
    let bottom = band(padding.bottom, height);
    let left = band(padding.left, width);
    let right = band(padding.right, width);

    let mut mask = Mask::filled(width, height, 1.0);
    for y in 0..height {
        for x in 0..width {
            if y < top || y >= height.saturating_sub(bottom) || x < left || x >= width.saturating_sub(right) {
                mask.data[y * width + x] = 0.0;
            }
        }
    }

    if blur_amount > 0 {
        let sigma = blur_amount as f32 * 0.25;
        if let Some(buffer) = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(width as u32, height as u32, mask.data.clone()) {
            let blurred = image::imageops::blur(&buffer, sigma);
            mask.data = blurred.into_raw().into_iter().map(|v| v.clamp(0.0, 1.0)).collect();
        }
    }

    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unblurred_mask_has_hard_border() {
        let mask = box_mask(16, 16, 0.0, Padding::default());
        // blur_area floors at 1 pixel per edge
        assert_eq!(mask.get(0, 0), 0.0);
        assert_eq!(mask.get(15, 8), 0.0);
        assert_eq!(mask.get(8, 8), 1.0);
        assert_eq!(mask.get(1, 1), 1.0);
    }

    #[test]
    fn test_padding_zeroes_edge_band() {
        let mask = box_mask(100, 100, 0.0, Padding { top: 20, right: 0, bottom: 0, left: 0 });
        assert_eq!(mask.get(50, 19), 0.0);
        assert_eq!(mask.get(50, 20), 1.0);
        assert_eq!(mask.get(50, 98), 1.0);
    }

    #[test]
    fn test_blur_feathers_but_keeps_center() {
        let mask = box_mask(64, 64, 0.5, Padding::default());
        let center = mask.get(32, 32);
        let edge = mask.get(2, 32);
        assert!(center > 0.95, "center {center}");
        assert!(edge < center, "edge {edge} should be below center {center}");
        assert!(mask.data.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_sample_outside_is_zero() {
        let mask = Mask::filled(4, 4, 1.0);
        assert_eq!(mask.sample(-2.0, 1.0), 0.0);
        assert_eq!(mask.sample(1.0, 1.0), 1.0);
    }
}
