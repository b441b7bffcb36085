use async_trait::async_trait;
use image::{ImageBuffer, Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use trapex_core::{CapturedFrame, Facing, SensorRotation};

use crate::device::{BindError, CameraBinding, CameraProvider, DeviceError};

/// What the next capture on a [`ScriptedCamera`] does.
#[derive(Debug)]
pub enum ScriptedCapture {
    /// Deliver this image, tagged with the binding's facing.
    Frame(RgbImage),
    /// Deliver this frame verbatim (e.g. a corrupt buffer).
    Raw(CapturedFrame),
    /// Fail with a device error carrying this message.
    Fail(String),
    /// Never resolve.
    Hang,
    /// Wait for the signal, then deliver the image.
    AfterSignal(Arc<Notify>, RgbImage),
}

struct ScriptState {
    facings: Vec<Facing>,
    permission: bool,
    sensor_rotation: SensorRotation,
    script: Mutex<VecDeque<ScriptedCapture>>,
    binds: AtomicUsize,
    releases: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    capture_started: Notify,
}

/// Deterministic camera for tests and demos. Captures follow a queue of
/// [`ScriptedCapture`] steps; an empty queue yields a small gray frame.
#[derive(Clone)]
pub struct ScriptedCamera {
    state: Arc<ScriptState>,
}

impl Default for ScriptedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCamera {
    pub fn new() -> Self {
        Self::build(vec![Facing::Back, Facing::Front], true, SensorRotation::Deg0)
    }

    fn build(facings: Vec<Facing>, permission: bool, sensor_rotation: SensorRotation) -> Self {
        Self {
            state: Arc::new(ScriptState {
                facings,
                permission,
                sensor_rotation,
                script: Mutex::new(VecDeque::new()),
                binds: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                max_live: AtomicUsize::new(0),
                capture_started: Notify::new(),
            }),
        }
    }

    pub fn with_facings(self, facings: &[Facing]) -> Self {
        Self::build(facings.to_vec(), self.state.permission, self.state.sensor_rotation)
    }

    pub fn with_sensor_rotation(self, rotation: SensorRotation) -> Self {
        Self::build(self.state.facings.clone(), self.state.permission, rotation)
    }

    pub fn without_permission(self) -> Self {
        Self::build(self.state.facings.clone(), false, self.state.sensor_rotation)
    }

    pub fn push(&self, step: ScriptedCapture) {
        self.state
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
    }

    pub fn bind_count(&self) -> usize {
        self.state.binds.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live bindings seen so far.
    pub fn max_live_bindings(&self) -> usize {
        self.state.max_live.load(Ordering::SeqCst)
    }

    /// Resolves once a capture has started on any binding.
    pub async fn wait_for_capture_started(&self) {
        self.state.capture_started.notified().await;
    }
}

#[async_trait]
impl CameraProvider for ScriptedCamera {
    fn has_permission(&self) -> bool {
        self.state.permission
    }

    async fn bind(&self, facing: Facing) -> Result<Box<dyn CameraBinding>, BindError> {
        if !self.state.permission {
            return Err(BindError::PermissionDenied);
        }
        if !self.state.facings.contains(&facing) {
            return Err(BindError::NoSuchCamera(facing));
        }
        self.state.binds.fetch_add(1, Ordering::SeqCst);
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(ScriptedBinding {
            state: self.state.clone(),
            facing,
            released: AtomicBool::new(false),
        }))
    }
}

struct ScriptedBinding {
    state: Arc<ScriptState>,
    facing: Facing,
    released: AtomicBool,
}

impl ScriptedBinding {
    fn frame(&self, image: RgbImage) -> CapturedFrame {
        CapturedFrame::from_rgb(image, self.facing, self.state.sensor_rotation)
    }
}

#[async_trait]
impl CameraBinding for ScriptedBinding {
    fn facing(&self) -> Facing {
        self.facing
    }

    async fn capture(&self) -> Result<CapturedFrame, DeviceError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(DeviceError::Released);
        }
        let step = self
            .state
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        self.state.capture_started.notify_one();

        match step {
            None => Ok(self.frame(ImageBuffer::from_fn(4, 2, |_, _| Rgb([200, 200, 200])))),
            Some(ScriptedCapture::Frame(image)) => Ok(self.frame(image)),
            Some(ScriptedCapture::Raw(frame)) => Ok(frame),
            Some(ScriptedCapture::Fail(message)) => Err(DeviceError::Other(message)),
            Some(ScriptedCapture::Hang) => std::future::pending().await,
            Some(ScriptedCapture::AfterSignal(signal, image)) => {
                signal.notified().await;
                Ok(self.frame(image))
            }
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.state.releases.fetch_add(1, Ordering::SeqCst);
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
