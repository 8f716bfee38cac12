//! Frame type and pixel helpers: RGB buffers, resizing, blending.

use image::imageops::FilterType;
use image::RgbImage;

/// Bytes per pixel of the interleaved RGB layout.
pub const CHANNELS: usize = 3;

/// A decoded RGB raster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Interleaved RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap raw RGB bytes, checking the buffer matches the dimensions.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// A frame of a single solid colour.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * CHANNELS)
            .collect();
        Self {
            data,
            width,
            height,
        }
    }

    pub fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
        }
    }

    pub fn to_image(&self) -> RgbImage {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// RGB value at (x, y). Out-of-range coordinates clamp to the border.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let x = x.min(self.width.saturating_sub(1)) as usize;
        let y = y.min(self.height.saturating_sub(1)) as usize;
        let idx = (y * self.width as usize + x) * CHANNELS;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        self.data[idx..idx + CHANNELS].copy_from_slice(&rgb);
    }

    /// Resize to exactly `width` × `height` with a triangle filter.
    pub fn resize(&self, width: u32, height: u32) -> Frame {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let resized = image::imageops::resize(&self.to_image(), width, height, FilterType::Triangle);
        Frame::from_image(resized)
    }
}

/// Alpha-blend `overlay` onto `base`. `percent` = 0 keeps `base`, 100 yields `overlay`.
pub fn blend(base: &Frame, overlay: &Frame, percent: u8) -> Result<Frame, FrameError> {
    if base.width != overlay.width || base.height != overlay.height {
        return Err(FrameError::DimensionMismatch {
            left: (base.width, base.height),
            right: (overlay.width, overlay.height),
        });
    }
    let alpha = f32::from(percent.min(100)) / 100.0;
    let data = base
        .data
        .iter()
        .zip(overlay.data.iter())
        .map(|(&b, &o)| (f32::from(b) * (1.0 - alpha) + f32::from(o) * alpha).round().clamp(0.0, 255.0) as u8)
        .collect();
    Ok(Frame {
        data,
        width: base.width,
        height: base.height,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid RGB length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame dimensions differ: {left:?} vs {right:?}")]
    DimensionMismatch { left: (u32, u32), right: (u32, u32) },
}
