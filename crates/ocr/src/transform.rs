use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, GrayImage, ImageEncoder, RgbImage};
use thiserror::Error;
use trapex_core::{CapturedFrame, Facing, NormalizedImage, SensorRotation};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("Encoding failed: {0}")]
    EncodingFailed(String),
}

/// Longest edge handed to the OCR engine.
const MAX_OCR_EDGE: u32 = 2800;

/// Turn a raw frame into an upright bitmap.
///
/// Front-facing frames are rotated 90° clockwise and then mirrored, which
/// undoes the front sensor's mounting and the selfie mirror in one step.
/// Back-facing frames are rotated by their sensor rotation only.
pub fn normalize(frame: CapturedFrame) -> Result<NormalizedImage, TransformError> {
    let (width, height) = (frame.width(), frame.height());
    let facing = frame.facing();
    let rotation = frame.sensor_rotation();

    let expected = width as usize * height as usize * 3;
    if frame.pixels().len() != expected {
        return Err(TransformError::EncodingFailed(format!(
            "frame buffer holds {} bytes, expected {expected} for {width}x{height} RGB",
            frame.pixels().len()
        )));
    }
    let rgb = RgbImage::from_raw(width, height, frame.into_pixels()).ok_or_else(|| {
        TransformError::EncodingFailed(format!("invalid {width}x{height} frame buffer"))
    })?;

    let upright = match facing {
        Facing::Front => imageops::flip_horizontal(&imageops::rotate90(&rgb)),
        Facing::Back => match rotation {
            SensorRotation::Deg0 => rgb,
            SensorRotation::Deg90 => imageops::rotate90(&rgb),
            SensorRotation::Deg180 => imageops::rotate180(&rgb),
            SensorRotation::Deg270 => imageops::rotate270(&rgb),
        },
    };
    Ok(NormalizedImage::from_rgb(upright))
}

/// Re-encode as JPEG at `quality` (0–100) for storage or transmission.
pub fn compress(image: &NormalizedImage, quality: u8) -> Result<Vec<u8>, TransformError> {
    if quality > 100 {
        return Err(TransformError::EncodingFailed(format!(
            "JPEG quality must be within 0-100, got {quality}"
        )));
    }
    let rgb = image.as_rgb();
    let mut buf = Vec::new();
    // The encoder's floor is 1.
    JpegEncoder::new_with_quality(&mut buf, quality.max(1))
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|e| TransformError::EncodingFailed(e.to_string()))?;
    Ok(buf)
}

/// Grayscale, contrast-stretch and PNG-encode an image for the OCR engine.
///
/// Images whose longest edge exceeds the engine's comfortable size are
/// scaled down first, keeping their aspect ratio.
pub fn prepare_for_ocr(image: &NormalizedImage) -> Result<Vec<u8>, TransformError> {
    let mut luma = imageops::grayscale(image.as_rgb());
    if let Some((width, height)) = ocr_dimensions(luma.width(), luma.height()) {
        luma = imageops::resize(&luma, width, height, FilterType::Triangle);
    }
    stretch_contrast(&mut luma);

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(luma.as_raw(), luma.width(), luma.height(), ExtendedColorType::L8)
        .map_err(|e| TransformError::EncodingFailed(e.to_string()))?;
    Ok(png)
}

/// Target size for an image too large for OCR, or `None` if it fits.
fn ocr_dimensions(width: u32, height: u32) -> Option<(u32, u32)> {
    let longest = width.max(height);
    if longest <= MAX_OCR_EDGE {
        return None;
    }
    let scale = |edge: u32| {
        let scaled = u64::from(edge) * u64::from(MAX_OCR_EDGE) / u64::from(longest);
        scaled.max(1) as u32
    };
    Some((scale(width), scale(height)))
}

/// Spread the luma range over 0..=255. Flat images are left alone.
fn stretch_contrast(luma: &mut GrayImage) {
    let raw = luma.as_raw();
    let (Some(&darkest), Some(&brightest)) = (raw.iter().min(), raw.iter().max()) else {
        return;
    };
    if darkest == brightest {
        return;
    }
    let span = u16::from(brightest - darkest);
    let levels: [u8; 256] = std::array::from_fn(|level| {
        let offset = u16::from((level as u8).saturating_sub(darkest));
        (offset.min(span) * 255 / span) as u8
    });
    for px in luma.pixels_mut() {
        px.0[0] = levels[usize::from(px.0[0])];
    }
}
