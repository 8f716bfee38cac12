use morph_core::{AgeBracket, AnalyserOptions, Device, FaceOrder, Gender};
use morph_media::{normalize_padding, Padding};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Frame processors known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    ContentAnalyser,
    FaceSwapper,
    FaceEnhancer,
    FrameEnhancer,
}

impl ProcessorKind {
    pub const ALL: [ProcessorKind; 4] = [
        ProcessorKind::ContentAnalyser,
        ProcessorKind::FaceSwapper,
        ProcessorKind::FaceEnhancer,
        ProcessorKind::FrameEnhancer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorKind::ContentAnalyser => "content_analyser",
            ProcessorKind::FaceSwapper => "face_swapper",
            ProcessorKind::FaceEnhancer => "face_enhancer",
            ProcessorKind::FrameEnhancer => "frame_enhancer",
        }
    }
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessorKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown frame processor '{s}'"))
    }
}

/// How processors pick the target faces they act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceSelectorMode {
    /// Faces similar to the references resolved during bootstrap.
    #[default]
    Reference,
    /// The face at `reference_face_position` of every frame.
    One,
    /// Every detected face.
    Many,
}

impl FromStr for FaceSelectorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reference" => Ok(FaceSelectorMode::Reference),
            "one" => Ok(FaceSelectorMode::One),
            "many" => Ok(FaceSelectorMode::Many),
            _ => Err(format!("unknown face selector mode '{s}'")),
        }
    }
}

/// Immutable snapshot of every run parameter.
///
/// Built from defaults, an optional TOML file and `MORPH_*` variables; the
/// CLI layers its flags on top before calling [`PipelineConfig::validate`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub sources: Vec<PathBuf>,
    pub target: Option<PathBuf>,
    pub output: Option<PathBuf>,

    /// Active processors, in execution order.
    pub processors: Vec<ProcessorKind>,

    /// Execution device. `None` falls back to the last device used.
    pub device: Option<Device>,
    /// Intra-op threads per model session.
    pub execution_thread_count: usize,
    /// Data-segment limit in GiB applied before models load. 0 = unlimited.
    pub max_memory: u64,

    pub face_selector_mode: FaceSelectorMode,
    pub reference_face_position: usize,
    /// Maximum cosine distance for a face to match a reference.
    pub reference_face_distance: f32,

    pub face_detector_size: usize,
    pub face_detector_score: f32,
    pub face_analyser_order: FaceOrder,
    pub face_analyser_age: Option<AgeBracket>,
    pub face_analyser_gender: Option<Gender>,

    /// Mask feather, fraction of the crop size in [0, 1].
    pub face_mask_blur: f32,
    /// One to four percentages, CSS shorthand order.
    pub face_mask_padding: Vec<u32>,

    pub face_swapper_model: String,
    pub face_enhancer_model: String,
    pub face_enhancer_blend: u8,
    pub frame_enhancer_model: String,
    pub frame_enhancer_blend: u8,

    pub output_image_quality: u8,
    /// Abort when the content analyser flags the target.
    pub skip_nsfw: bool,
    pub skip_download: bool,

    pub model_dir: PathBuf,
    /// File remembering the device of the last successful run.
    pub device_state_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            target: None,
            output: None,
            processors: vec![ProcessorKind::FaceSwapper],
            device: None,
            execution_thread_count: 4,
            max_memory: 0,
            face_selector_mode: FaceSelectorMode::Reference,
            reference_face_position: 0,
            reference_face_distance: 0.6,
            face_detector_size: 640,
            face_detector_score: 0.5,
            face_analyser_order: FaceOrder::LeftRight,
            face_analyser_age: None,
            face_analyser_gender: None,
            face_mask_blur: 0.3,
            face_mask_padding: vec![0, 0, 0, 0],
            face_swapper_model: "inswapper_128".to_string(),
            face_enhancer_model: "gfpgan_1.4".to_string(),
            face_enhancer_blend: 80,
            frame_enhancer_model: "real_esrgan_x2plus".to_string(),
            frame_enhancer_blend: 80,
            output_image_quality: 80,
            skip_nsfw: true,
            skip_download: false,
            model_dir: morph_core::models::default_model_dir(),
            device_state_path: default_state_dir().join("last_device"),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `MORPH_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Defaults, then the TOML file at `path` (if any), then `MORPH_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        Ok(base.with_env())
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn with_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("MORPH_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("MORPH_DEVICE_STATE") {
            self.device_state_path = PathBuf::from(path);
        }
        if let Some(device) = env_parse("MORPH_DEVICE") {
            self.device = Some(device);
        }
        if let Ok(list) = std::env::var("MORPH_PROCESSORS") {
            match parse_processor_list(&list) {
                Ok(processors) => self.processors = processors,
                Err(e) => tracing::warn!(error = %e, "ignoring MORPH_PROCESSORS"),
            }
        }
        self.execution_thread_count = env_parse("MORPH_EXECUTION_THREAD_COUNT").unwrap_or(self.execution_thread_count);
        self.max_memory = env_parse("MORPH_MAX_MEMORY").unwrap_or(self.max_memory);
        self.face_selector_mode = env_parse("MORPH_FACE_SELECTOR_MODE").unwrap_or(self.face_selector_mode);
        self.reference_face_position = env_parse("MORPH_REFERENCE_FACE_POSITION").unwrap_or(self.reference_face_position);
        self.reference_face_distance = env_parse("MORPH_REFERENCE_FACE_DISTANCE").unwrap_or(self.reference_face_distance);
        self.face_detector_size = env_parse("MORPH_FACE_DETECTOR_SIZE").unwrap_or(self.face_detector_size);
        self.face_detector_score = env_parse("MORPH_FACE_DETECTOR_SCORE").unwrap_or(self.face_detector_score);
        self.face_analyser_order = env_parse("MORPH_FACE_ANALYSER_ORDER").unwrap_or(self.face_analyser_order);
        self.face_mask_blur = env_parse("MORPH_FACE_MASK_BLUR").unwrap_or(self.face_mask_blur);
        self.face_enhancer_blend = env_parse("MORPH_FACE_ENHANCER_BLEND").unwrap_or(self.face_enhancer_blend);
        self.frame_enhancer_blend = env_parse("MORPH_FRAME_ENHANCER_BLEND").unwrap_or(self.frame_enhancer_blend);
        self.output_image_quality = env_parse("MORPH_OUTPUT_IMAGE_QUALITY").unwrap_or(self.output_image_quality);
        self.skip_nsfw = env_bool("MORPH_SKIP_NSFW", self.skip_nsfw);
        self.skip_download = env_bool("MORPH_SKIP_DOWNLOAD", self.skip_download);
        self
    }

    /// Range and consistency checks. Run once before a snapshot is used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_settings()?;
        if self.processors.contains(&ProcessorKind::FaceSwapper) && self.sources.is_empty() {
            return Err(invalid("sources", "face_swapper needs at least one source image"));
        }
        Ok(())
    }

    /// [`validate`](Self::validate) without the per-run inputs, for checking
    /// a configuration file on its own.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.face_detector_score) {
            return Err(invalid("face_detector_score", "must be within [0, 1]"));
        }
        if !morph_core::detector::DETECTOR_SIZES.contains(&self.face_detector_size) {
            return Err(invalid(
                "face_detector_size",
                format!("{} is not one of {:?}", self.face_detector_size, morph_core::detector::DETECTOR_SIZES),
            ));
        }
        if !(0.0..=1.5).contains(&self.reference_face_distance) {
            return Err(invalid("reference_face_distance", "must be within [0, 1.5]"));
        }
        if !(0.0..=1.0).contains(&self.face_mask_blur) {
            return Err(invalid("face_mask_blur", "must be within [0, 1]"));
        }
        let padding = self
            .padding()
            .ok_or_else(|| invalid("face_mask_padding", "expects one to four values"))?;
        if padding.edges().iter().any(|&edge| edge > 100) {
            return Err(invalid("face_mask_padding", "edges must be within [0, 100]"));
        }
        for (key, value) in [
            ("face_enhancer_blend", self.face_enhancer_blend),
            ("frame_enhancer_blend", self.frame_enhancer_blend),
            ("output_image_quality", self.output_image_quality),
        ] {
            if value > 100 {
                return Err(invalid(key, "must be within [0, 100]"));
            }
        }
        if self.execution_thread_count == 0 {
            return Err(invalid("execution_thread_count", "must be at least 1"));
        }
        let mut seen = Vec::with_capacity(self.processors.len());
        for kind in &self.processors {
            if seen.contains(kind) {
                return Err(invalid("processors", format!("{kind} listed twice")));
            }
            seen.push(*kind);
        }
        Ok(())
    }

    /// Mask padding as top/right/bottom/left.
    pub fn padding(&self) -> Option<Padding> {
        normalize_padding(&self.face_mask_padding)
    }

    /// Analyser parameters for a run bound to `device`.
    pub fn analyser_options(&self, device: Device) -> AnalyserOptions {
        AnalyserOptions {
            device,
            detector_size: self.face_detector_size,
            score_threshold: self.face_detector_score,
            order: self.face_analyser_order,
            age: self.face_analyser_age,
            gender: self.face_analyser_gender,
            skip_download: self.skip_download,
        }
    }
}

/// Parse `face_swapper,face_enhancer` into processor kinds.
pub fn parse_processor_list(list: &str) -> Result<Vec<ProcessorKind>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| name.parse().map_err(|e: String| invalid("processors", e)))
        .collect()
}

/// `$XDG_STATE_HOME/morph`, else `~/.local/state/morph`.
pub fn default_state_dir() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/state")
        })
        .join("morph")
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0" && v != "false").unwrap_or(default)
}
