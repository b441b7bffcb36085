use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use trapex_core::{CapturedFrame, Facing};

use crate::device::{BindError, CameraBinding, CameraProvider};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("Camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("A capture is already in progress")]
    CaptureInProgress,
    #[error("Capture failed: {cause}")]
    CaptureFailed { cause: String },
}

impl From<BindError> for CaptureError {
    fn from(e: BindError) -> Self {
        CaptureError::DeviceUnavailable(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long a single capture may take before it is abandoned.
    pub capture_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { capture_timeout: Duration::from_secs(10) }
    }
}

struct SessionInner {
    binding: Option<Arc<dyn CameraBinding>>,
    facing: Facing,
    /// Set while a capture or a rebind is outstanding.
    busy: bool,
    closed: bool,
}

/// Owns the binding to one camera and hands out single frames on demand.
///
/// At most one capture is in flight at a time; overlapping calls fail fast
/// with [`CaptureError::CaptureInProgress`] instead of queuing.
pub struct CaptureSession {
    provider: Arc<dyn CameraProvider>,
    options: SessionOptions,
    inner: Mutex<SessionInner>,
    /// Woken whenever `busy` clears or the session closes.
    idle: Notify,
}

impl CaptureSession {
    pub async fn open(
        provider: Arc<dyn CameraProvider>,
        facing: Facing,
        options: SessionOptions,
    ) -> Result<Self, CaptureError> {
        if !provider.has_permission() {
            return Err(BindError::PermissionDenied.into());
        }
        let binding: Arc<dyn CameraBinding> = Arc::from(provider.bind(facing).await?);
        info!(%facing, "Camera bound");

        Ok(Self {
            provider,
            options,
            inner: Mutex::new(SessionInner {
                binding: Some(binding),
                facing,
                busy: false,
                closed: false,
            }),
            idle: Notify::new(),
        })
    }

    pub fn facing(&self) -> Facing {
        self.lock().facing
    }

    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        !inner.closed && inner.binding.is_some()
    }

    /// Whether a capture or rebind is currently outstanding.
    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    /// Capture exactly one frame from the bound camera.
    pub async fn capture_once(&self) -> Result<CapturedFrame, CaptureError> {
        let (binding, busy) = self.claim()?;
        self.run_capture(binding, busy).await
    }

    /// Like [`capture_once`](Self::capture_once), but a capture or rebind
    /// that is still winding down is waited out instead of rejected. The wait
    /// is bounded by the capture timeout, after which this fails with
    /// `CaptureInProgress`.
    pub async fn capture_when_idle(&self) -> Result<CapturedFrame, CaptureError> {
        let claimed = tokio::time::timeout(self.options.capture_timeout, self.claim_when_idle());
        let (binding, busy) = claimed.await.map_err(|_| {
            warn!("Camera stayed busy for {:?}", self.options.capture_timeout);
            CaptureError::CaptureInProgress
        })??;
        self.run_capture(binding, busy).await
    }

    async fn claim_when_idle(
        &self,
    ) -> Result<(Arc<dyn CameraBinding>, BusyGuard<'_>), CaptureError> {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            // Register before checking so a release in between is not missed.
            idle.as_mut().enable();
            match self.claim() {
                Err(CaptureError::CaptureInProgress) => {
                    debug!("Waiting for the previous capture to wind down");
                    idle.await;
                }
                claimed => return claimed,
            }
        }
    }

    /// Mark the session busy and hand out the binding to capture from.
    fn claim(&self) -> Result<(Arc<dyn CameraBinding>, BusyGuard<'_>), CaptureError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(CaptureError::DeviceUnavailable("capture session is closed".into()));
        }
        if inner.busy {
            return Err(CaptureError::CaptureInProgress);
        }
        let binding = inner.binding.clone().ok_or_else(|| {
            CaptureError::DeviceUnavailable(format!("no {} camera bound", inner.facing))
        })?;
        inner.busy = true;
        Ok((binding, BusyGuard { session: self }))
    }

    async fn run_capture(
        &self,
        binding: Arc<dyn CameraBinding>,
        _busy: BusyGuard<'_>,
    ) -> Result<CapturedFrame, CaptureError> {
        match tokio::time::timeout(self.options.capture_timeout, binding.capture()).await {
            Ok(Ok(frame)) => {
                debug!(
                    width = frame.width(),
                    height = frame.height(),
                    facing = %frame.facing(),
                    "Frame captured"
                );
                Ok(frame)
            }
            Ok(Err(e)) => {
                warn!("Capture failed: {e}");
                Err(CaptureError::CaptureFailed { cause: e.to_string() })
            }
            Err(_) => {
                warn!("Capture timed out after {:?}", self.options.capture_timeout);
                Err(CaptureError::CaptureFailed {
                    cause: format!("timed out after {}ms", self.options.capture_timeout.as_millis()),
                })
            }
        }
    }

    /// Release the current binding and rebind with the opposite facing.
    /// Returns the new facing.
    pub async fn switch_facing(&self) -> Result<Facing, CaptureError> {
        let (old, target) = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(CaptureError::DeviceUnavailable("capture session is closed".into()));
            }
            if inner.busy {
                return Err(CaptureError::CaptureInProgress);
            }
            inner.busy = true;
            (inner.binding.take(), inner.facing.opposite())
        };
        let _busy = BusyGuard { session: self };

        // The old binding must be fully released before the rebind.
        if let Some(old) = old {
            old.release();
            info!(facing = %old.facing(), "Camera released");
        }

        let bound = self.provider.bind(target).await;
        let mut inner = self.lock();
        inner.facing = target;
        match bound {
            Ok(binding) => {
                if inner.closed {
                    binding.release();
                    return Err(CaptureError::DeviceUnavailable("capture session is closed".into()));
                }
                inner.binding = Some(Arc::from(binding));
                info!(facing = %target, "Camera rebound");
                Ok(target)
            }
            Err(e) => {
                warn!("Rebind to {target} camera failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Release the binding. Safe to call any number of times.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
            if let Some(binding) = inner.binding.take() {
                binding.release();
                info!(facing = %binding.facing(), "Camera released");
            }
        }
        self.idle.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Clears the busy flag when a capture or rebind finishes or is dropped.
struct BusyGuard<'a> {
    session: &'a CaptureSession,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.session.lock().busy = false;
        self.session.idle.notify_waiters();
    }
}
