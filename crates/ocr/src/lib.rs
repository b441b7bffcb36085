pub mod archive;
pub mod recognizer;
pub mod transform;

pub use archive::{ContentDigest, ReceiptArchive, StoredAttachment};
pub use recognizer::{
    engine_from_config, CannedEngine, FailingEngine, OcrEngine, OcrError, RecognitionError,
    TextRecognitionClient,
};
pub use transform::{compress, normalize, prepare_for_ocr, TransformError};
