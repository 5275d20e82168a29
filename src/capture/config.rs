use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Preferred output resolution passed to the capture port as a hint only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionHint {
    pub width: u32,
    pub height: u32,
}

impl Default for ResolutionHint {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub resolution: ResolutionHint,
    pub include_audio: bool,
    /// Tried in order; the first one the encoder supports wins.
    pub preferred_mime_types: Vec<String>,
    pub fallback_mime_type: String,
    pub video_bits_per_second: u32,
    pub fragment_interval_ms: u64,
    pub finalize_timeout_ms: u64,
}

impl CaptureConfig {
    pub fn fragment_interval(&self) -> Duration {
        Duration::from_millis(self.fragment_interval_ms)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            resolution: ResolutionHint::default(),
            include_audio: true,
            preferred_mime_types: vec!["video/webm;codecs=vp9,opus".into()],
            fallback_mime_type: "video/webm".into(),
            video_bits_per_second: 2_500_000,
            fragment_interval_ms: 1_000,
            finalize_timeout_ms: 5_000,
        }
    }
}

/// What the session asks of the capture port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRequest {
    pub resolution: ResolutionHint,
    /// Best effort; the port may grant video only.
    pub audio: bool,
}

/// Parameters handed to the encoder port when attaching to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub mime_type: String,
    pub video_bits_per_second: u32,
    pub fragment_interval: Duration,
}

/// Container type without codec parameters, e.g. `video/webm`.
pub fn container_type(mime_type: &str) -> &str {
    mime_type.split(';').next().unwrap_or(mime_type).trim()
}
