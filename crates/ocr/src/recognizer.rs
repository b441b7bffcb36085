use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use trapex_core::{NormalizedImage, OcrBackendKind, OcrConfig};

use crate::transform::prepare_for_ocr;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Image decode error: {0}")]
    ImageDecode(String),
    #[error("OCR engine error: {0}")]
    Engine(String),
    #[error("Tesseract not available, build with the `tesseract` feature")]
    NotAvailable,
}

/// Abstraction over an OCR backend.
/// Implementations accept PNG image bytes and return the recognized text.
///
/// Engines hold no per-scan state, so one handle may serve any number of
/// clients concurrently.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image_png: &[u8]) -> Result<String, OcrError>;
}

/// Build the engine selected in the config.
pub fn engine_from_config(config: &OcrConfig) -> Result<Arc<dyn OcrEngine>, OcrError> {
    match config.backend {
        OcrBackendKind::Mock => Ok(Arc::new(CannedEngine::new(config.mock_text.clone()))),
        #[cfg(feature = "tesseract")]
        OcrBackendKind::Tesseract => Ok(Arc::new(tesseract::TesseractEngine::from_config(config))),
        #[cfg(not(feature = "tesseract"))]
        OcrBackendKind::Tesseract => Err(OcrError::NotAvailable),
    }
}

/// Answers every image with the same text. Backs the `mock` backend.
#[derive(Debug, Clone)]
pub struct CannedEngine {
    text: String,
}

impl CannedEngine {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl OcrEngine for CannedEngine {
    fn recognize(&self, _image_png: &[u8]) -> Result<String, OcrError> {
        Ok(self.text.clone())
    }
}

/// Rejects every image with an engine error carrying `message`.
#[derive(Debug, Clone)]
pub struct FailingEngine {
    message: String,
}

impl FailingEngine {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl OcrEngine for FailingEngine {
    fn recognize(&self, _image_png: &[u8]) -> Result<String, OcrError> {
        Err(OcrError::Engine(self.message.clone()))
    }
}

#[cfg(feature = "tesseract")]
pub mod tesseract {
    use super::{OcrEngine, OcrError};
    use leptess::LepTess;
    use std::path::PathBuf;
    use trapex_core::OcrConfig;

    /// Runs libtesseract. A fresh handle is opened per image, so the engine
    /// itself is freely shareable across threads.
    pub struct TesseractEngine {
        tessdata: Option<PathBuf>,
        language: String,
    }

    impl TesseractEngine {
        pub fn from_config(config: &OcrConfig) -> Self {
            Self { tessdata: config.data_path.clone(), language: config.language.clone() }
        }

        fn open(&self) -> Result<LepTess, OcrError> {
            let tessdata = self.tessdata.as_ref().map(|p| p.to_string_lossy().into_owned());
            LepTess::new(tessdata.as_deref(), &self.language)
                .map_err(|e| OcrError::Engine(format!("cannot load '{}': {e}", self.language)))
        }
    }

    impl OcrEngine for TesseractEngine {
        fn recognize(&self, image_png: &[u8]) -> Result<String, OcrError> {
            let mut handle = self.open()?;
            handle
                .set_image_from_mem(image_png)
                .map_err(|e| OcrError::ImageDecode(e.to_string()))?;
            handle.get_utf8_text().map_err(|e| OcrError::Engine(e.to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecognitionError {
    #[error("Text recognition failed: {cause}")]
    RecognitionFailed { cause: String },
}

fn failed(cause: impl Display) -> RecognitionError {
    RecognitionError::RecognitionFailed { cause: cause.to_string() }
}

/// Submits normalized images to an [`OcrEngine`] off the async runtime and
/// maps every engine failure to [`RecognitionError`]. No retries.
#[derive(Clone)]
pub struct TextRecognitionClient {
    engine: Arc<dyn OcrEngine>,
    timeout: Option<Duration>,
}

impl TextRecognitionClient {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self { engine, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn engine(&self) -> &Arc<dyn OcrEngine> {
        &self.engine
    }

    /// Recognize the text in `image`. An image without legible text yields
    /// `Ok("")`.
    pub async fn recognize(&self, image: NormalizedImage) -> Result<String, RecognitionError> {
        let engine = self.engine.clone();
        let (width, height) = (image.width(), image.height());
        let work = tokio::task::spawn_blocking(move || {
            let png = prepare_for_ocr(&image).map_err(failed)?;
            engine.recognize(&png).map_err(failed)
        });

        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                warn!("Recognition timed out after {limit:?}");
                failed(format!("timed out after {}ms", limit.as_millis()))
            })?,
            None => work.await,
        };
        let text = joined.map_err(|e| failed(format!("recognition worker failed: {e}")))??;

        debug!(width, height, chars = text.chars().count(), "Text recognized");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};

    fn blank() -> NormalizedImage {
        let img: RgbImage = ImageBuffer::from_fn(8, 8, |_, _| Rgb([255, 255, 255]));
        NormalizedImage::from_rgb(img)
    }

    struct SlowEngine(Duration);

    impl OcrEngine for SlowEngine {
        fn recognize(&self, _image_png: &[u8]) -> Result<String, OcrError> {
            std::thread::sleep(self.0);
            Ok("late".into())
        }
    }

    struct PanickingEngine;

    impl OcrEngine for PanickingEngine {
        fn recognize(&self, _image_png: &[u8]) -> Result<String, OcrError> {
            panic!("engine crashed")
        }
    }

    /// Checks that the engine is handed PNG bytes.
    struct PngSniffer;

    impl OcrEngine for PngSniffer {
        fn recognize(&self, image_png: &[u8]) -> Result<String, OcrError> {
            if image_png.starts_with(b"\x89PNG") {
                Ok("png".into())
            } else {
                Err(OcrError::ImageDecode("not a png".into()))
            }
        }
    }

    #[tokio::test]
    async fn client_returns_engine_text() {
        let client = TextRecognitionClient::new(Arc::new(CannedEngine::new("TOTAL $12.34")));
        assert_eq!(client.recognize(blank()).await.unwrap(), "TOTAL $12.34");
    }

    #[tokio::test]
    async fn empty_text_is_success() {
        let client = TextRecognitionClient::new(Arc::new(CannedEngine::new("")));
        assert_eq!(client.recognize(blank()).await, Ok(String::new()));
    }

    #[tokio::test]
    async fn engine_receives_preprocessed_png() {
        let client = TextRecognitionClient::new(Arc::new(PngSniffer));
        assert_eq!(client.recognize(blank()).await.unwrap(), "png");
    }

    #[tokio::test]
    async fn engine_error_is_wrapped() {
        let client = TextRecognitionClient::new(Arc::new(FailingEngine::new("quota exceeded")));
        let RecognitionError::RecognitionFailed { cause } =
            client.recognize(blank()).await.unwrap_err();
        assert!(cause.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn engine_panic_is_wrapped() {
        let client = TextRecognitionClient::new(Arc::new(PanickingEngine));
        let RecognitionError::RecognitionFailed { cause } =
            client.recognize(blank()).await.unwrap_err();
        assert!(cause.contains("worker failed"));
    }

    #[tokio::test]
    async fn slow_engine_times_out() {
        let client = TextRecognitionClient::new(Arc::new(SlowEngine(Duration::from_millis(300))))
            .with_timeout(Duration::from_millis(20));
        let RecognitionError::RecognitionFailed { cause } =
            client.recognize(blank()).await.unwrap_err();
        assert!(cause.contains("timed out"));
    }

    #[tokio::test]
    async fn engine_handle_is_shared() {
        let engine: Arc<dyn OcrEngine> = Arc::new(CannedEngine::new("shared"));
        let a = TextRecognitionClient::new(engine.clone());
        let b = TextRecognitionClient::new(engine.clone());
        let (ra, rb) = tokio::join!(a.recognize(blank()), b.recognize(blank()));
        assert_eq!(ra.unwrap(), "shared");
        assert_eq!(rb.unwrap(), "shared");
        assert!(Arc::ptr_eq(a.engine(), b.engine()));
    }

    #[test]
    fn config_selects_mock_backend() {
        let config = OcrConfig { mock_text: "from config".into(), ..OcrConfig::default() };
        let engine = engine_from_config(&config).unwrap();
        assert_eq!(engine.recognize(b"").unwrap(), "from config");
    }

    #[cfg(not(feature = "tesseract"))]
    #[test]
    fn tesseract_requires_feature() {
        let config = OcrConfig { backend: OcrBackendKind::Tesseract, ..OcrConfig::default() };
        assert!(matches!(engine_from_config(&config), Err(OcrError::NotAvailable)));
    }
}
