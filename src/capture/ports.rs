//! Seams between the capture session and the host platform.
//!
//! A browser host maps these onto display-media and media-recorder APIs; a
//! native host maps them onto its screen-capture and encoder frameworks.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capture::config::{DisplayRequest, EncoderSettings};
use crate::error::CaptureError;

/// Acquires display-capture streams.
#[async_trait]
pub trait CapturePort: Send + Sync {
    /// Prompts the user (or OS) for a display stream.
    ///
    /// Returns `PermissionDenied` when the prompt is declined and
    /// `CaptureUnavailable` when the platform has no display capture.
    async fn request_display(
        &self,
        request: &DisplayRequest,
    ) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

/// An open capture handle. Owned exclusively by the session's driver task.
pub trait CaptureStream: Send {
    fn id(&self) -> &str;

    fn has_audio(&self) -> bool;

    /// Cancelled when the video track ends outside the application's
    /// control, e.g. the user stops sharing from native chrome.
    fn ended(&self) -> CancellationToken;

    /// Stops every track. Called exactly once per stream.
    fn stop_tracks(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    Fragment(Vec<u8>),
    Failed(String),
}

/// Request the encoder to flush. The encoder emits any trailing fragment
/// and then closes its event channel.
pub trait EncoderControl: Send {
    fn finish(&mut self);
}

pub struct EncoderHandle {
    pub events: mpsc::UnboundedReceiver<EncoderEvent>,
    pub control: Box<dyn EncoderControl>,
}

/// Creates incremental encoders attached to a capture stream.
pub trait EncoderPort: Send + Sync {
    fn is_type_supported(&self, mime_type: &str) -> bool;

    fn attach(
        &self,
        stream: &dyn CaptureStream,
        settings: &EncoderSettings,
    ) -> Result<EncoderHandle, CaptureError>;
}
