//! Model catalog and asset provisioning.
//!
//! Maps model ids to ONNX files and their download URLs. The catalog is
//! embedded at compile time from `assets/models.toml`.

use serde::Deserialize;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

const CATALOG_TOML: &str = include_str!("../assets/models.toml");

static CATALOG: OnceLock<Vec<ModelSpec>> = OnceLock::new();

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("unknown model id: {0}")]
    Unknown(String),
    #[error("model file missing: {0} (downloads disabled or no source URL)")]
    Missing(PathBuf),
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// What a model is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    FaceDetector,
    FaceRecognizer,
    FaceAttributes,
    FaceSwapper,
    EmbeddingMap,
    FaceEnhancer,
    FrameEnhancer,
    ContentAnalyser,
}

/// One catalog entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub role: ModelRole,
    pub file: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl ModelSpec {
    /// Location of this model inside `model_dir`.
    pub fn path_in(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(&self.file)
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    model: Vec<ModelSpec>,
}

fn catalog_db() -> &'static Vec<ModelSpec> {
    CATALOG.get_or_init(|| match toml::from_str::<CatalogFile>(CATALOG_TOML) {
        Ok(file) => file.model,
        Err(e) => {
            tracing::error!(error = %e, "bad embedded model catalog");
            Vec::new()
        }
    })
}

/// All known models.
pub fn catalog() -> &'static [ModelSpec] {
    catalog_db()
}

/// Look up a model by id.
pub fn lookup(id: &str) -> Result<&'static ModelSpec, ModelError> {
    catalog_db()
        .iter()
        .find(|m| m.id == id)
        .ok_or_else(|| ModelError::Unknown(id.to_string()))
}

/// Default directory for model files: `$MORPH_MODEL_DIR`, else
/// `$XDG_DATA_HOME/morph/models`, else `~/.local/share/morph/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MORPH_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("morph")
        .join("models")
}

/// Make sure the model file exists, downloading it when allowed.
pub fn ensure_asset(spec: &ModelSpec, model_dir: &Path, skip_download: bool) -> Result<PathBuf, ModelError> {
    let path = spec.path_in(model_dir);
    if path.is_file() {
        return Ok(path);
    }
    let url = match (&spec.url, skip_download) {
        (Some(url), false) => url,
        _ => return Err(ModelError::Missing(path)),
    };
    std::fs::create_dir_all(model_dir)?;
    tracing::info!(model = %spec.id, %url, "downloading model");
    download(url, &path)?;
    Ok(path)
}

/// Fetch `url` into `destination` via a staged temp file in the same directory.
fn download(url: &str, destination: &Path) -> Result<(), ModelError> {
    let fail = |reason: String| ModelError::Download {
        url: url.to_string(),
        reason,
    };

    let response = ureq::get(url).call().map_err(|e| fail(e.to_string()))?;
    let expected: Option<u64> = response
        .header("Content-Length")
        .and_then(|v| v.parse().ok());

    let directory = destination.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(directory)?;

    let written = {
        let mut reader = response.into_reader();
        let mut writer = BufWriter::new(staged.as_file_mut());
        let written = std::io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        written
    };

    if let Some(expected) = expected {
        if expected != written {
            return Err(fail(format!("truncated: {written} of {expected} bytes")));
        }
    }

    staged.persist(destination).map_err(|e| ModelError::Io(e.error))?;
    tracing::info!(path = %destination.display(), bytes = written, "model downloaded");
    Ok(())
}
