pub mod controller;
pub mod state;

pub use controller::{ScanError, ScanningController, StateStream};
pub use state::{FailureReason, ScanState, ScanTransition, StateKind};
