use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use trapex_core::{CapturedFrame, Facing, SensorRotation};

use crate::device::{BindError, CameraBinding, CameraProvider, DeviceError};

struct StillInner {
    facings: Vec<Facing>,
    sensor_rotation: SensorRotation,
    permission: bool,
    queue_tx: mpsc::UnboundedSender<PathBuf>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<PathBuf>>,
}

/// A file-backed camera: each capture waits for the next queued image path,
/// reads it and decodes it into a frame.
///
/// Used for the CLI and for watch-folder intake, where "the shutter" is a
/// file landing on disk.
#[derive(Clone)]
pub struct StillImageCamera {
    inner: Arc<StillInner>,
}

impl Default for StillImageCamera {
    fn default() -> Self {
        Self::new(&[Facing::Back, Facing::Front], SensorRotation::Deg0)
    }
}

impl StillImageCamera {
    pub fn new(facings: &[Facing], sensor_rotation: SensorRotation) -> Self {
        Self::build(facings.to_vec(), sensor_rotation, true)
    }

    fn build(facings: Vec<Facing>, sensor_rotation: SensorRotation, permission: bool) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(StillInner {
                facings,
                sensor_rotation,
                permission,
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
            }),
        }
    }

    pub fn with_permission(self, granted: bool) -> Self {
        Self::build(self.inner.facings.clone(), self.inner.sensor_rotation, granted)
    }

    /// Queue an image file to be delivered by the next capture.
    pub fn enqueue(&self, path: impl Into<PathBuf>) {
        // The receiver lives in `inner`, so the channel cannot be closed here.
        let _ = self.inner.queue_tx.send(path.into());
    }
}

#[async_trait]
impl CameraProvider for StillImageCamera {
    fn has_permission(&self) -> bool {
        self.inner.permission
    }

    async fn bind(&self, facing: Facing) -> Result<Box<dyn CameraBinding>, BindError> {
        if !self.inner.permission {
            return Err(BindError::PermissionDenied);
        }
        if !self.inner.facings.contains(&facing) {
            return Err(BindError::NoSuchCamera(facing));
        }
        Ok(Box::new(StillBinding {
            inner: self.inner.clone(),
            facing,
            released: AtomicBool::new(false),
        }))
    }
}

struct StillBinding {
    inner: Arc<StillInner>,
    facing: Facing,
    released: AtomicBool,
}

#[async_trait]
impl CameraBinding for StillBinding {
    fn facing(&self) -> Facing {
        self.facing
    }

    async fn capture(&self) -> Result<CapturedFrame, DeviceError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(DeviceError::Released);
        }
        let path = {
            let mut rx = self.inner.queue_rx.lock().await;
            rx.recv().await.ok_or(DeviceError::Released)?
        };
        debug!("Reading still image {}", path.display());

        let bytes = tokio::fs::read(&path).await?;
        let facing = self.facing;
        let rotation = self.inner.sensor_rotation;
        let frame = tokio::task::spawn_blocking(move || {
            CapturedFrame::from_encoded(&bytes, facing, rotation)
        })
        .await
        .map_err(|e| DeviceError::Other(format!("decode worker failed: {e}")))??;
        Ok(frame)
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
