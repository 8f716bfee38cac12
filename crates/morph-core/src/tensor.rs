//! Frame ↔ tensor conversions shared by the model wrappers.

use crate::backend::Tensor;
use morph_media::Frame;
use ndarray::{Array4, Axis, IxDyn};

/// Channel order a network expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

impl ChannelOrder {
    fn source_channel(self, c: usize) -> usize {
        match self {
            ChannelOrder::Rgb => c,
            ChannelOrder::Bgr => 2 - c,
        }
    }
}

/// Per-channel `(value - mean) / std`, in network channel order.
#[derive(Debug, Clone, Copy)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    pub const fn uniform(mean: f32, std: f32) -> Self {
        Self {
            mean: [mean; 3],
            std: [std; 3],
        }
    }
}

/// `[1, 3, H, W]` tensor from an RGB frame.
pub fn frame_to_nchw(frame: &Frame, norm: Normalization, order: ChannelOrder) -> Tensor {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for y in 0..h {
        for x in 0..w {
            let rgb = frame.pixel(x as u32, y as u32);
            for c in 0..3 {
                let value = f32::from(rgb[order.source_channel(c)]);
                tensor[[0, c, y, x]] = (value - norm.mean[c]) / norm.std[c];
            }
        }
    }
    tensor.into_dyn()
}

/// `[1, H, W, 3]` tensor from an RGB frame.
pub fn frame_to_nhwc(frame: &Frame, norm: Normalization, order: ChannelOrder) -> Tensor {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let mut tensor = Array4::<f32>::zeros((1, h, w, 3));
    for y in 0..h {
        for x in 0..w {
            let rgb = frame.pixel(x as u32, y as u32);
            for c in 0..3 {
                let value = f32::from(rgb[order.source_channel(c)]);
                tensor[[0, y, x, c]] = (value - norm.mean[c]) / norm.std[c];
            }
        }
    }
    tensor.into_dyn()
}

/// RGB frame from a `[1, 3, H, W]` (or `[3, H, W]`) tensor.
///
/// `to_pixel` maps a network value to the 0–255 range. `None` if the shape
/// is not a 3-channel image.
pub fn nchw_to_frame(tensor: &Tensor, order: ChannelOrder, to_pixel: impl Fn(f32) -> f32) -> Option<Frame> {
    let view = match tensor.ndim() {
        4 if tensor.shape()[0] == 1 => tensor.index_axis(Axis(0), 0),
        3 => tensor.view(),
        _ => return None,
    };
    let shape = view.shape();
    if shape[0] != 3 {
        return None;
    }
    let (h, w) = (shape[1], shape[2]);
    let mut frame = Frame::filled(w as u32, h as u32, [0, 0, 0]);
    for y in 0..h {
        for x in 0..w {
            let mut rgb = [0u8; 3];
            for c in 0..3 {
                let value = view[IxDyn(&[order.source_channel(c), y, x])];
                rgb[c] = to_pixel(value).round().clamp(0.0, 255.0) as u8;
            }
            frame.put_pixel(x as u32, y as u32, rgb);
        }
    }
    Some(frame)
}
