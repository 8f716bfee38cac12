//! Output-path and padding normalisation, plus scoped scratch directories.

use crate::frame::Frame;
use crate::io;
use std::path::{Path, PathBuf};

/// Per-edge padding in percent of the crop size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Padding {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl Padding {
    pub fn uniform(value: u32) -> Self {
        Self {
            top: value,
            right: value,
            bottom: value,
            left: value,
        }
    }

    /// Edges in top/right/bottom/left order.
    pub fn edges(&self) -> [u32; 4] {
        [self.top, self.right, self.bottom, self.left]
    }
}

/// Expand one to four values into a [`Padding`], CSS shorthand style:
/// `[a]`, `[vertical, horizontal]`, `[top, horizontal, bottom]`, `[top, right, bottom, left]`.
pub fn normalize_padding(values: &[u32]) -> Option<Padding> {
    match *values {
        [a] => Some(Padding::uniform(a)),
        [v, h] => Some(Padding {
            top: v,
            right: h,
            bottom: v,
            left: h,
        }),
        [t, h, b] => Some(Padding {
            top: t,
            right: h,
            bottom: b,
            left: h,
        }),
        [t, r, b, l] => Some(Padding {
            top: t,
            right: r,
            bottom: b,
            left: l,
        }),
        _ => None,
    }
}

/// Resolve where a run writes its result.
///
/// - `output` is a directory: `<output>/<source>-<target>.<ext>` when a source file
///   exists, else `<output>/<target>.<ext>`.
/// - `output` is a file path with an extension inside an existing directory: same
///   stem, extension forced to the target's.
/// - Anything else with a target file resolves to `None`.
///
/// A bare file name (no directory component) resolves against the current directory.
pub fn normalize_output_path(
    source: Option<&Path>,
    target: Option<&Path>,
    output: Option<&Path>,
) -> Option<PathBuf> {
    let target = target.filter(|t| t.is_file());
    let Some(target) = target else {
        return output.map(Path::to_path_buf);
    };
    let output = output?;
    let target_stem = target.file_stem()?.to_string_lossy().into_owned();
    let target_ext = target
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();

    if output.is_dir() {
        let name = match source.filter(|s| s.is_file()).and_then(Path::file_stem) {
            Some(source_stem) => format!("{}-{target_stem}", source_stem.to_string_lossy()),
            None => target_stem,
        };
        return Some(output.join(with_extension(&name, &target_ext)));
    }

    output.extension()?;
    let output_stem = output.file_stem()?.to_string_lossy().into_owned();
    let directory = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !directory.is_dir() {
        return None;
    }
    Some(directory.join(with_extension(&output_stem, &target_ext)))
}

fn with_extension(stem: &str, ext: &str) -> String {
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}

/// A scratch directory removed, with its contents, when dropped.
///
/// Intermediate images live here so every exit path (success, abort,
/// panic unwind) cleans up.
pub struct ScratchDir {
    dir: tempfile::TempDir,
}

impl ScratchDir {
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("morph-").tempdir()?;
        tracing::debug!(path = %dir.path().display(), "scratch directory created");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path for a named file inside the scratch directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write `frame` as a lossless PNG named `name` and return its path.
    pub fn write_frame(&self, name: &str, frame: &Frame) -> Result<PathBuf, io::MediaError> {
        let path = self.file(&format!("{name}.png"));
        io::save_image(&path, frame, 100)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_padding() {
        assert_eq!(normalize_padding(&[0, 0, 0, 0]), Some(Padding::default()));
        assert_eq!(normalize_padding(&[1]), Some(Padding::uniform(1)));
        assert_eq!(normalize_padding(&[1, 2]).unwrap().edges(), [1, 2, 1, 2]);
        assert_eq!(normalize_padding(&[1, 2, 3]).unwrap().edges(), [1, 2, 3, 2]);
        assert_eq!(normalize_padding(&[1, 2, 3, 4]).unwrap().edges(), [1, 2, 3, 4]);
        assert_eq!(normalize_padding(&[]), None);
        assert_eq!(normalize_padding(&[1, 2, 3, 4, 5]), None);
    }

    fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.jpg");
        let target = dir.path().join("target.png");
        std::fs::write(&source, b"x").unwrap();
        std::fs::write(&target, b"x").unwrap();
        (dir, source, target)
    }

    #[test]
    fn test_output_directory_with_source() {
        let (dir, source, target) = fixture();
        let resolved = normalize_output_path(Some(&source), Some(&target), Some(dir.path()));
        assert_eq!(resolved, Some(dir.path().join("source-target.png")));
    }

    #[test]
    fn test_output_directory_without_source() {
        let (dir, _, target) = fixture();
        let resolved = normalize_output_path(None, Some(&target), Some(dir.path()));
        assert_eq!(resolved, Some(dir.path().join("target.png")));
    }

    #[test]
    fn test_output_file_takes_target_extension() {
        let (dir, _, target) = fixture();
        let output = dir.path().join("result.jpg");
        let resolved = normalize_output_path(None, Some(&target), Some(&output));
        assert_eq!(resolved, Some(dir.path().join("result.png")));
    }

    #[test]
    fn test_output_invalid_locations() {
        let (dir, source, target) = fixture();
        let missing_dir = dir.path().join("invalid").join("output.png");
        assert_eq!(normalize_output_path(None, Some(&target), Some(&missing_dir)), None);
        let no_extension = dir.path().join("invalid");
        assert_eq!(normalize_output_path(None, Some(&target), Some(&no_extension)), None);
        assert_eq!(normalize_output_path(Some(&source), Some(&target), None), None);
    }

    #[test]
    fn test_output_passthrough_without_target() {
        let output = Path::new("/tmp/anything.png");
        assert_eq!(
            normalize_output_path(None, None, Some(output)),
            Some(output.to_path_buf())
        );
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let scratch = ScratchDir::new().unwrap();
        let path = scratch.write_frame("probe", &Frame::filled(2, 2, [1, 2, 3])).unwrap();
        assert!(path.is_file());
        let root = scratch.path().to_path_buf();
        drop(scratch);
        assert!(!root.exists());
    }
}
