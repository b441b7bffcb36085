pub mod device;
pub mod scripted;
pub mod session;
pub mod still;

pub use device::{BindError, CameraBinding, CameraProvider, DeviceError};
pub use scripted::{ScriptedCamera, ScriptedCapture};
pub use session::{CaptureError, CaptureSession, SessionOptions};
pub use still::StillImageCamera;
