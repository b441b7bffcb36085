use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which physical camera a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    #[default]
    Back,
}

impl Facing {
    pub fn opposite(self) -> Self {
        match self {
            Facing::Front => Facing::Back,
            Facing::Back => Facing::Front,
        }
    }
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facing::Front => write!(f, "front"),
            Facing::Back => write!(f, "back"),
        }
    }
}

impl std::str::FromStr for Facing {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "front" => Ok(Facing::Front),
            "back" => Ok(Facing::Back),
            other => Err(format!("Unknown camera facing: '{other}'")),
        }
    }
}

/// Clockwise rotation that brings a raw sensor frame upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum SensorRotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl SensorRotation {
    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees % 360 {
            0 => Some(SensorRotation::Deg0),
            90 => Some(SensorRotation::Deg90),
            180 => Some(SensorRotation::Deg180),
            270 => Some(SensorRotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            SensorRotation::Deg0 => 0,
            SensorRotation::Deg90 => 90,
            SensorRotation::Deg180 => 180,
            SensorRotation::Deg270 => 270,
        }
    }

    /// Whether correcting this rotation swaps width and height.
    pub fn swaps_axes(self) -> bool {
        matches!(self, SensorRotation::Deg90 | SensorRotation::Deg270)
    }
}

impl TryFrom<u16> for SensorRotation {
    type Error = String;
    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        SensorRotation::from_degrees(degrees)
            .ok_or_else(|| format!("Sensor rotation must be a multiple of 90, got {degrees}"))
    }
}

impl From<SensorRotation> for u16 {
    fn from(r: SensorRotation) -> Self {
        r.degrees()
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Failed to decode captured image: {0}")]
    Decode(#[from] image::ImageError),
}

/// A raw RGB8 frame straight off a camera binding.
///
/// The buffer is not validated on construction: hardware can hand back short
/// or oversized buffers, and the transformer is where that is rejected.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    facing: Facing,
    sensor_rotation: SensorRotation,
}

impl CapturedFrame {
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        facing: Facing,
        sensor_rotation: SensorRotation,
    ) -> Self {
        Self { pixels, width, height, facing, sensor_rotation }
    }

    /// Decode JPEG / PNG / WEBP bytes into a frame.
    pub fn from_encoded(
        data: &[u8],
        facing: Facing,
        sensor_rotation: SensorRotation,
    ) -> Result<Self, FrameError> {
        let rgb = image::load_from_memory(data)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Self::new(rgb.into_raw(), width, height, facing, sensor_rotation))
    }

    pub fn from_rgb(rgb: RgbImage, facing: Facing, sensor_rotation: SensorRotation) -> Self {
        let (width, height) = rgb.dimensions();
        Self::new(rgb.into_raw(), width, height, facing, sensor_rotation)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn sensor_rotation(&self) -> SensorRotation {
        self.sensor_rotation
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Give up the frame, yielding its pixel buffer.
    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}

/// An upright, correctly mirrored bitmap ready for OCR.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage(RgbImage);

impl NormalizedImage {
    pub fn from_rgb(rgb: RgbImage) -> Self {
        Self(rgb)
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.0
    }
}
