use async_trait::async_trait;
use thiserror::Error;
use trapex_core::{CapturedFrame, Facing, FrameError};

#[derive(Debug, Error)]
pub enum BindError {
    #[error("No {0} camera available")]
    NoSuchCamera(Facing),
    #[error("Camera permission not granted")]
    PermissionDenied,
    #[error("Camera bind failed: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] FrameError),
    #[error("Camera binding was released")]
    Released,
    #[error("{0}")]
    Other(String),
}

/// An opaque camera capability: something that can hand out bindings for a
/// given facing.
///
/// Whether the host has granted camera access is decided outside this crate;
/// `has_permission` reports that decision.
#[async_trait]
pub trait CameraProvider: Send + Sync {
    fn has_permission(&self) -> bool;

    async fn bind(&self, facing: Facing) -> Result<Box<dyn CameraBinding>, BindError>;
}

/// A live binding to one physical camera.
#[async_trait]
pub trait CameraBinding: Send + Sync {
    fn facing(&self) -> Facing;

    /// Acquire one frame. Resolves when the hardware delivers it.
    async fn capture(&self) -> Result<CapturedFrame, DeviceError>;

    /// Release the hardware. Captures after release fail with
    /// [`DeviceError::Released`].
    fn release(&self);
}
