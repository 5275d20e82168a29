pub mod artifact;
pub mod config;
pub mod ports;
pub mod session;
pub mod simulated;

pub use artifact::RecordingArtifact;
pub use config::{CaptureConfig, DisplayRequest, EncoderSettings, ResolutionHint};
pub use ports::{CapturePort, CaptureStream, EncoderControl, EncoderEvent, EncoderHandle, EncoderPort};
pub use session::{CaptureSession, SessionPhase};
