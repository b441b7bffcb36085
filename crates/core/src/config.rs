use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::frame::{Facing, SensorRotation};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub camera: CameraConfig,
    pub ocr: OcrConfig,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub facing: Facing,
    pub capture_timeout_ms: u64,
    /// Mounting rotation of the back sensor, in degrees.
    pub sensor_rotation: SensorRotation,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            facing: Facing::Back,
            capture_timeout_ms: 10_000,
            sensor_rotation: SensorRotation::Deg0,
        }
    }
}

impl CameraConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrBackendKind {
    #[default]
    Mock,
    Tesseract,
}

impl std::str::FromStr for OcrBackendKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(OcrBackendKind::Mock),
            "tesseract" => Ok(OcrBackendKind::Tesseract),
            other => Err(format!("Unknown OCR backend: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub backend: OcrBackendKind,
    pub language: String,
    /// Tesseract `tessdata` directory; `None` uses the system default.
    pub data_path: Option<PathBuf>,
    pub recognition_timeout_ms: u64,
    /// Text returned by the mock backend.
    pub mock_text: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            backend: OcrBackendKind::Mock,
            language: "eng".to_string(),
            data_path: None,
            recognition_timeout_ms: 30_000,
            mock_text: String::new(),
        }
    }
}

impl OcrConfig {
    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_millis(self.recognition_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// JPEG quality (0–100) for exported receipt images.
    pub jpeg_quality: u8,
    /// Archive directory; `None` means `<data dir>/attachments`.
    pub dir: Option<PathBuf>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self { jpeg_quality: 80, dir: None }
    }
}

impl ScanConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Like [`ScanConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// `<platform config dir>/trapex/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "trapex", "Trapex")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|var| std::env::var(var).ok());
    }

    /// Apply `TRAPEX_*` overrides from an arbitrary lookup. Invalid values are
    /// logged and ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(facing) = parse_override::<Facing>(&lookup, "TRAPEX_FACING") {
            self.camera.facing = facing;
        }
        if let Some(backend) = parse_override::<OcrBackendKind>(&lookup, "TRAPEX_OCR_BACKEND") {
            self.ocr.backend = backend;
        }
        if let Some(ms) = parse_override::<u64>(&lookup, "TRAPEX_CAPTURE_TIMEOUT_MS") {
            self.camera.capture_timeout_ms = ms;
        }
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let val = lookup(var)?;
    match val.parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!("Invalid value '{}' for {}: {}. Ignoring.", val, var, e);
            None
        }
    }
}
