use serde::Serialize;

/// Failures of a single capture attempt. All of them are terminal for the
/// attempt; the caller retries with a fresh `start()`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Display capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Encoder failure: {0}")]
    EncoderFailure(String),

    #[error("Recording already in progress")]
    AlreadyRecording,

    #[error("A finished recording is pending; reset the session first")]
    ArtifactPending,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    #[error("Access denied: {0}")]
    Denied(String),

    #[error("Storage transport error: {0}")]
    Transport(String),

    #[error("Storage IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("Upload timed out after {0} seconds")]
    UploadTimeout(u64),

    #[error("Upload failed: {0}")]
    UploadTransportError(#[from] StorageError),

    #[error("Upload aborted")]
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// Duplicate submission, or the campaign's per-user limit is reached.
    #[error("Submission conflict: {0}")]
    RegistrationConflict(String),

    #[error("Submission registration failed: {0}")]
    RegistrationError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("Submission limit reached ({existing} of {max})")]
    LimitReached { existing: u32, max: u32 },

    #[error("Campaign {0} is not accepting submissions")]
    CampaignInactive(String),

    #[error("Cannot {action} while {phase}")]
    InvalidTransition { action: &'static str, phase: String },

    #[error("Another operation is in flight")]
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SurfaceError {
    #[error("Floating surface not supported")]
    Unsupported,

    #[error("Floating surface request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

macro_rules! serialize_as_string {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Serialize for $ty {
                fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
                where
                    S: serde::Serializer,
                {
                    serializer.serialize_str(&self.to_string())
                }
            }
        )+
    };
}

serialize_as_string!(
    CaptureError,
    StorageError,
    UploadError,
    RegistrationError,
    SubmissionError,
    SurfaceError,
    ConfigError,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_serialize_as_display_strings() {
        let err = SubmissionError::LimitReached { existing: 1, max: 1 };
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            "\"Submission limit reached (1 of 1)\""
        );

        let err = UploadError::from(StorageError::Transport("connection reset".into()));
        assert_eq!(err.to_string(), "Upload failed: Storage transport error: connection reset");
    }

    #[test]
    fn wrapped_errors_keep_their_message() {
        let err: SubmissionError = CaptureError::PermissionDenied("user declined".into()).into();
        assert_eq!(err.to_string(), "Permission denied: user declined");
    }
}
