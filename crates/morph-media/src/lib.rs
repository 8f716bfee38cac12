//! morph-media — Frames, image I/O and filesystem plumbing.
//!
//! Provides the RGB frame type shared by every stage, decode/encode with
//! atomic writes, output-path normalisation and scoped scratch directories.

pub mod frame;
pub mod io;
pub mod paths;

pub use frame::{blend, Frame, FrameError};
pub use io::{is_image, is_valid_image, read_image, save_image, write_image, MediaError};
pub use paths::{normalize_output_path, normalize_padding, Padding, ScratchDir};
