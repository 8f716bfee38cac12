//! Remembers the execution device of the last successful run.

use morph_core::Device;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A one-line state file holding a device name.
#[derive(Debug, Clone)]
pub struct DeviceLedger {
    path: PathBuf,
}

impl DeviceLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last recorded device. Missing or unparsable files read as `None`.
    pub fn load(&self) -> Option<Device> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        match text.trim().parse() {
            Ok(device) => Some(device),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring device state file");
                None
            }
        }
    }

    /// Record `device`, replacing the file atomically.
    pub fn save(&self, device: Device) -> std::io::Result<()> {
        let directory = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(directory)?;
        let mut staged = tempfile::NamedTempFile::new_in(directory)?;
        writeln!(staged, "{device}")?;
        staged.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
