use serde::Serialize;

use crate::capture::SessionPhase;
use crate::submission::{CoordinatorPhase, SubmissionRecord};

/// Event name constants for backend -> UI communication
pub const RECORDING_STATE_CHANGED: &str = "recording:state-changed";
pub const RECORDING_DURATION: &str = "recording:duration";
pub const RECORDING_COMPLETED: &str = "recording:completed";
pub const RECORDING_FAILED: &str = "recording:failed";
pub const UPLOAD_PROGRESS: &str = "upload:progress";
pub const SUBMISSION_STATE_CHANGED: &str = "submission:state-changed";
pub const SUBMISSION_REGISTERED: &str = "submission:registered";
pub const SUBMISSION_FAILED: &str = "submission:failed";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum RecorderEvent {
    RecordingStateChanged { phase: SessionPhase },
    RecordingDuration { elapsed_seconds: u64 },
    RecordingCompleted { duration_seconds: u64, size_bytes: usize },
    RecordingFailed { message: String },
    UploadProgress { percent: u8 },
    SubmissionStateChanged { phase: CoordinatorPhase },
    SubmissionRegistered { record: SubmissionRecord },
    SubmissionFailed { message: String },
}

impl RecorderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RecorderEvent::RecordingStateChanged { .. } => RECORDING_STATE_CHANGED,
            RecorderEvent::RecordingDuration { .. } => RECORDING_DURATION,
            RecorderEvent::RecordingCompleted { .. } => RECORDING_COMPLETED,
            RecorderEvent::RecordingFailed { .. } => RECORDING_FAILED,
            RecorderEvent::UploadProgress { .. } => UPLOAD_PROGRESS,
            RecorderEvent::SubmissionStateChanged { .. } => SUBMISSION_STATE_CHANGED,
            RecorderEvent::SubmissionRegistered { .. } => SUBMISSION_REGISTERED,
            RecorderEvent::SubmissionFailed { .. } => SUBMISSION_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_is_tagged() {
        let ev = RecorderEvent::UploadProgress { percent: 10 };
        assert_eq!(ev.name(), UPLOAD_PROGRESS);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "upload_progress");
        assert_eq!(json["payload"]["percent"], 10);
    }
}
