use serde::Serialize;
use std::fmt;

/// Why an attempt ended in [`ScanState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    /// The camera could not deliver a frame.
    Capture(String),
    /// The frame could not be normalized or the OCR engine failed.
    Recognition(String),
}

impl FailureReason {
    pub fn message(&self) -> &str {
        match self {
            FailureReason::Capture(m) | FailureReason::Recognition(m) => m,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Capture(m) => write!(f, "capture: {m}"),
            FailureReason::Recognition(m) => write!(f, "recognition: {m}"),
        }
    }
}

/// The observable state of a scanning session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    Capturing,
    Processing,
    Succeeded { text: String },
    Failed { reason: FailureReason },
}

impl ScanState {
    pub fn kind(&self) -> StateKind {
        match self {
            ScanState::Idle => StateKind::Idle,
            ScanState::Capturing => StateKind::Capturing,
            ScanState::Processing => StateKind::Processing,
            ScanState::Succeeded { .. } => StateKind::Succeeded,
            ScanState::Failed { .. } => StateKind::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            ScanState::Succeeded { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Idle,
    Capturing,
    Processing,
    Succeeded,
    Failed,
}

impl StateKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, StateKind::Succeeded | StateKind::Failed)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, StateKind::Capturing | StateKind::Processing)
    }

    /// The edges of the scan state machine. `Capturing`/`Processing` → `Idle`
    /// is an aborted attempt.
    pub fn can_transition_to(self, next: StateKind) -> bool {
        use StateKind::*;
        matches!(
            (self, next),
            (Idle, Capturing)
                | (Capturing, Processing)
                | (Capturing, Failed)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Succeeded, Idle)
                | (Failed, Idle)
                | (Capturing, Idle)
                | (Processing, Idle)
        )
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKind::Idle => write!(f, "idle"),
            StateKind::Capturing => write!(f, "capturing"),
            StateKind::Processing => write!(f, "processing"),
            StateKind::Succeeded => write!(f, "succeeded"),
            StateKind::Failed => write!(f, "failed"),
        }
    }
}

/// One published state, tagged with the attempt generation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanTransition {
    pub generation: u64,
    pub state: ScanState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ScanState::Succeeded { text: String::new() }.is_terminal());
        assert!(ScanState::Failed { reason: FailureReason::Capture("x".into()) }.is_terminal());
        assert!(!ScanState::Processing.is_terminal());
        assert!(!ScanState::Idle.is_terminal());
    }

    #[test]
    fn no_shortcut_from_idle_to_terminal() {
        assert!(!StateKind::Idle.can_transition_to(StateKind::Succeeded));
        assert!(!StateKind::Idle.can_transition_to(StateKind::Failed));
        assert!(!StateKind::Idle.can_transition_to(StateKind::Processing));
        assert!(!StateKind::Capturing.can_transition_to(StateKind::Succeeded));
        assert!(!StateKind::Succeeded.can_transition_to(StateKind::Capturing));
        assert!(StateKind::Capturing.can_transition_to(StateKind::Failed));
    }

    #[test]
    fn serializes_with_state_tag() {
        let json = serde_json::to_value(ScanState::Succeeded { text: "TOTAL $12.34".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"state": "succeeded", "text": "TOTAL $12.34"}));

        let json = serde_json::to_value(ScanState::Failed {
            reason: FailureReason::Capture("timed out".into()),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "state": "failed",
                "reason": {"stage": "capture", "message": "timed out"}
            })
        );

        assert_eq!(serde_json::to_value(ScanState::Idle).unwrap(), serde_json::json!({"state": "idle"}));
    }

    #[test]
    fn failure_reason_display() {
        assert_eq!(FailureReason::Recognition("quota".into()).to_string(), "recognition: quota");
        assert_eq!(FailureReason::Capture("no frame".into()).message(), "no frame");
    }
}
