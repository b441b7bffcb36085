use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trapex_camera::{CaptureError, CaptureSession};
use trapex_core::{Facing, NormalizedImage};
use trapex_ocr::{normalize, TextRecognitionClient};

use crate::state::{FailureReason, ScanState, ScanTransition, StateKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("Cannot start a capture while {from}")]
    InvalidTransition { from: StateKind },
    #[error("Scanning controller is closed")]
    Closed,
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

struct Core {
    state: ScanState,
    /// Bumped when an attempt starts and when one is aborted. Work whose
    /// generation no longer matches is discarded.
    generation: u64,
    closed: bool,
    subscribers: Vec<mpsc::UnboundedSender<ScanTransition>>,
    /// Upright image behind the current `Succeeded` state.
    image: Option<NormalizedImage>,
}

struct Inner {
    session: CaptureSession,
    recognizer: TextRecognitionClient,
    core: Mutex<Core>,
    state_tx: watch::Sender<ScanState>,
    generation_tx: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `next`. Callers hold the core lock, which is what keeps every
    /// observer's view of an attempt in order.
    fn publish(&self, core: &mut Core, next: ScanState) {
        let from = core.state.kind();
        let to = next.kind();
        debug_assert!(from.can_transition_to(to), "illegal scan transition {from} -> {to}");
        info!(generation = core.generation, %from, %to, "Scan state changed");

        core.state = next.clone();
        core.image = None;
        self.state_tx.send_replace(next.clone());
        let transition = ScanTransition { generation: core.generation, state: next };
        core.subscribers.retain(|tx| tx.send(transition.clone()).is_ok());
    }

    /// Move attempt `generation` to `next`, unless it has been superseded.
    fn advance(&self, generation: u64, next: ScanState) -> bool {
        self.advance_with_image(generation, next, None)
    }

    fn advance_with_image(
        &self,
        generation: u64,
        next: ScanState,
        image: Option<NormalizedImage>,
    ) -> bool {
        let mut core = self.lock();
        if core.closed || core.generation != generation {
            warn!(generation, current = core.generation, "Discarding result of stale scan attempt");
            return false;
        }
        self.publish(&mut core, next);
        core.image = image;
        true
    }

    fn bump_generation(&self, core: &mut Core) {
        core.generation += 1;
        self.generation_tx.send_replace(core.generation);
    }
}

/// Drives capture → normalize → recognize and owns the observable
/// [`ScanState`]. Cloning yields another handle to the same controller.
///
/// One attempt at a time: `start_capture` outside `Idle` is rejected, never
/// queued.
#[derive(Clone)]
pub struct ScanningController {
    inner: Arc<Inner>,
}

impl ScanningController {
    pub fn new(session: CaptureSession, recognizer: TextRecognitionClient) -> Self {
        let (state_tx, _) = watch::channel(ScanState::Idle);
        let (generation_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                session,
                recognizer,
                core: Mutex::new(Core {
                    state: ScanState::Idle,
                    generation: 0,
                    closed: false,
                    subscribers: Vec::new(),
                    image: None,
                }),
                state_tx,
                generation_tx,
            }),
        }
    }

    pub fn state(&self) -> ScanState {
        self.inner.lock().state.clone()
    }

    /// Latest-value view of the state, for renderers that only need the
    /// current screen.
    pub fn watch(&self) -> watch::Receiver<ScanState> {
        self.inner.state_tx.subscribe()
    }

    /// Every transition, in order, starting with the current state.
    pub fn subscribe(&self) -> StateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut core = self.inner.lock();
        if !core.closed {
            let _ = tx.send(ScanTransition { generation: core.generation, state: core.state.clone() });
            core.subscribers.push(tx);
        }
        StateStream { rx }
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn facing(&self) -> Facing {
        self.inner.session.facing()
    }

    /// Take the upright image the current `Succeeded` text was read from.
    /// `None` in any other state, or once taken.
    pub fn take_image(&self) -> Option<NormalizedImage> {
        self.inner.lock().image.take()
    }

    /// Enter `Capturing` and return the attempt to drive.
    ///
    /// The state check and the move to `Capturing` happen before this
    /// returns. The future resolves to the terminal state, or `None` if the
    /// attempt was aborted by [`reset`](Self::reset) or [`close`](Self::close).
    pub fn start_capture(
        &self,
    ) -> Result<impl Future<Output = Option<ScanState>> + Send + 'static, ScanError> {
        let generation = {
            let mut core = self.inner.lock();
            if core.closed {
                return Err(ScanError::Closed);
            }
            if core.state != ScanState::Idle {
                debug!(state = %core.state.kind(), "Rejecting start_capture");
                return Err(ScanError::InvalidTransition { from: core.state.kind() });
            }
            self.inner.bump_generation(&mut core);
            self.inner.publish(&mut core, ScanState::Capturing);
            core.generation
        };

        let controller = self.clone();
        Ok(async move { controller.run_attempt(generation).await })
    }

    /// Like [`start_capture`](Self::start_capture), but drives the attempt on
    /// a spawned task.
    pub fn spawn_capture(&self) -> Result<JoinHandle<Option<ScanState>>, ScanError> {
        Ok(tokio::spawn(self.start_capture()?))
    }

    async fn run_attempt(&self, generation: u64) -> Option<ScanState> {
        let inner = &self.inner;
        let mut generation_rx = inner.generation_tx.subscribe();

        let captured = tokio::select! {
            biased;
            _ = generation_rx.wait_for(|g| *g != generation) => {
                debug!(generation, "Attempt aborted during capture");
                return None;
            }
            // A superseded attempt may still be letting go of the camera.
            result = inner.session.capture_when_idle() => result,
        };

        let frame = match captured {
            Ok(frame) => frame,
            Err(e) => {
                let failed = ScanState::Failed { reason: FailureReason::Capture(e.to_string()) };
                return inner.advance(generation, failed.clone()).then_some(failed);
            }
        };

        if !inner.advance(generation, ScanState::Processing) {
            return None;
        }

        let recognition = async move {
            let image = tokio::task::spawn_blocking(move || normalize(frame))
                .await
                .map_err(|e| format!("normalize worker failed: {e}"))?
                .map_err(|e| e.to_string())?;
            let text = inner.recognizer.recognize(image.clone()).await.map_err(|e| e.to_string())?;
            Ok::<_, String>((text, image))
        };
        let recognized = tokio::select! {
            biased;
            _ = generation_rx.wait_for(|g| *g != generation) => {
                debug!(generation, "Attempt aborted during recognition");
                return None;
            }
            result = recognition => result,
        };

        let (terminal, image) = match recognized {
            Ok((text, image)) => (ScanState::Succeeded { text }, Some(image)),
            Err(message) => {
                (ScanState::Failed { reason: FailureReason::Recognition(message) }, None)
            }
        };
        inner.advance_with_image(generation, terminal.clone(), image).then_some(terminal)
    }

    /// Return to `Idle`. From a terminal state this clears the result; from
    /// `Capturing`/`Processing` it aborts the attempt and its eventual result
    /// is dropped. Idempotent.
    pub fn reset(&self) {
        let mut core = self.inner.lock();
        let kind = core.state.kind();
        if kind == StateKind::Idle {
            return;
        }
        if kind.is_in_flight() {
            warn!(generation = core.generation, state = %kind, "Aborting in-flight scan attempt");
            self.inner.bump_generation(&mut core);
        }
        self.inner.publish(&mut core, ScanState::Idle);
    }

    /// Switch the camera between front and back. Rejected with
    /// `CaptureInProgress` while the state is `Capturing`, whether or not the
    /// attempt has reached the camera yet.
    pub async fn switch_facing(&self) -> Result<Facing, ScanError> {
        {
            let core = self.inner.lock();
            if core.closed {
                return Err(ScanError::Closed);
            }
            if core.state.kind() == StateKind::Capturing {
                debug!(generation = core.generation, "Rejecting switch_facing");
                return Err(CaptureError::CaptureInProgress.into());
            }
        }
        Ok(self.inner.session.switch_facing().await?)
    }

    /// Abort any attempt, release the camera and end all subscriptions.
    /// Idempotent.
    pub fn close(&self) {
        {
            let mut core = self.inner.lock();
            if core.closed {
                return;
            }
            self.inner.bump_generation(&mut core);
            if core.state.kind() != StateKind::Idle {
                self.inner.publish(&mut core, ScanState::Idle);
            }
            core.closed = true;
            core.subscribers.clear();
        }
        self.inner.session.close();
        info!("Scanning controller closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Ordered stream of [`ScanTransition`]s. Ends when the controller closes.
pub struct StateStream {
    rx: mpsc::UnboundedReceiver<ScanTransition>,
}

impl StateStream {
    pub async fn next(&mut self) -> Option<ScanTransition> {
        self.rx.recv().await
    }

    /// Everything published so far, without waiting.
    pub fn drain(&mut self) -> Vec<ScanTransition> {
        let mut out = Vec::new();
        while let Ok(t) = self.rx.try_recv() {
            out.push(t);
        }
        out
    }
}
