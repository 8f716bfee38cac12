//! Image I/O: decode to [`Frame`], atomic encode, content-type probing.
//!
//! Reads never fail loudly: an unreadable or missing file is `None`.
//! Writes go through a temp file in the destination directory followed by
//! a rename, so a destination path never holds a half-written image.

use crate::frame::Frame;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageReader};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("unsupported image extension: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode the image at `path` into an RGB frame.
///
/// The format is sniffed from content, not the extension.
pub fn read_image(path: &Path) -> Option<Frame> {
    let decoded = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(image::ImageError::IoError)
        .and_then(|reader| reader.decode());

    match decoded {
        Ok(image) => Some(Frame::from_image(image.to_rgb8())),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "image unreadable");
            None
        }
    }
}

/// Encode `frame` to `path`, choosing the codec from the extension.
///
/// Returns `false` on any failure (unknown extension, unwritable directory).
pub fn write_image(path: &Path, frame: &Frame, quality: u8) -> bool {
    match save_image(path, frame, quality) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "image write failed");
            false
        }
    }
}

/// Fallible form of [`write_image`].
pub fn save_image(path: &Path, frame: &Frame, quality: u8) -> Result<(), MediaError> {
    let format =
        ImageFormat::from_path(path).map_err(|_| MediaError::UnsupportedFormat(path.to_path_buf()))?;
    let directory = parent_directory(path);
    let suffix = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let mut staged = tempfile::Builder::new()
        .prefix(".morph-")
        .suffix(&suffix)
        .tempfile_in(directory)?;

    {
        let image = frame.to_image();
        let mut writer = BufWriter::new(staged.as_file_mut());
        match format {
            ImageFormat::Jpeg => {
                JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100)).encode_image(&image)?
            }
            other => image.write_to(&mut writer, other)?,
        }
        writer.flush()?;
    }

    staged.persist(path).map_err(|e| MediaError::Io(e.error))?;
    tracing::debug!(path = %path.display(), ?format, "image written");
    Ok(())
}

/// Whether `path` is an existing file whose content decodes as a known image type.
pub fn is_image(path: &Path) -> bool {
    sniff_format(path).is_some()
}

/// Whether `path` holds a structurally valid image of the type its extension
/// names. Decodes the header to confirm dimensions are readable.
pub fn is_valid_image(path: &Path) -> bool {
    let Some(sniffed) = sniff_format(path) else {
        return false;
    };
    if let Ok(expected) = ImageFormat::from_path(path) {
        if expected != sniffed {
            tracing::debug!(path = %path.display(), ?expected, ?sniffed, "image type mismatch");
            return false;
        }
    }
    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(image::ImageError::IoError)
        .and_then(|reader| reader.into_dimensions())
        .map(|(w, h)| w > 0 && h > 0)
        .unwrap_or(false)
}

fn sniff_format(path: &Path) -> Option<ImageFormat> {
    if !path.is_file() {
        return None;
    }
    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .ok()
        .and_then(|reader| reader.format())
}

fn parent_directory(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
