pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod pip;
pub mod submission;
pub mod upload;

pub use capture::{CaptureSession, RecordingArtifact, SessionPhase};
pub use config::AppConfig;
pub use error::{CaptureError, RegistrationError, StorageError, SubmissionError, UploadError};
pub use events::RecorderEvent;
pub use pip::PipMirror;
pub use submission::{Campaign, CoordinatorPhase, SubmissionCoordinator, SubmissionRecord};
pub use upload::{StorageReference, UploadPipeline};
