pub mod config;
pub mod frame;

pub use config::{CameraConfig, ConfigError, ExportConfig, OcrBackendKind, OcrConfig, ScanConfig};
pub use frame::{CapturedFrame, Facing, FrameError, NormalizedImage, SensorRotation};
