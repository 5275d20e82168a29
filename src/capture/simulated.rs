//! Headless capture and encoder ports.
//!
//! Used by the demo binary and tests. The encoder emits WebM-shaped
//! fragments on the configured cadence so artifacts look like real output.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capture::config::{DisplayRequest, EncoderSettings};
use crate::capture::ports::{
    CapturePort, CaptureStream, EncoderControl, EncoderEvent, EncoderHandle, EncoderPort,
};
use crate::error::CaptureError;

/// EBML magic that opens every WebM file.
pub const WEBM_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
const CLUSTER_ID: [u8; 4] = [0x1F, 0x43, 0xB6, 0x75];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
    Grant,
    GrantVideoOnly,
    Deny,
    Unavailable,
}

/// Counters shared between a simulated capture port and the test or demo
/// driving it.
#[derive(Debug, Clone, Default)]
pub struct StreamProbe {
    inner: Arc<ProbeInner>,
}

#[derive(Debug, Default)]
struct ProbeInner {
    requests: AtomicUsize,
    releases: AtomicUsize,
    current: Mutex<Option<CancellationToken>>,
}

impl StreamProbe {
    /// Number of times the prompt was shown.
    pub fn requests(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }

    /// Number of `stop_tracks` calls across all streams.
    pub fn releases(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }

    /// Simulates the user pressing "stop sharing" in native chrome.
    pub fn end_track(&self) {
        let current = self.inner.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = current.as_ref() {
            token.cancel();
        }
    }
}

pub struct SimulatedCapture {
    outcome: Mutex<PromptOutcome>,
    prompt_delay: Duration,
    probe: StreamProbe,
}

impl SimulatedCapture {
    pub fn new() -> Self {
        Self::with_outcome(PromptOutcome::Grant)
    }

    pub fn with_outcome(outcome: PromptOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            prompt_delay: Duration::ZERO,
            probe: StreamProbe::default(),
        }
    }

    /// Time the simulated user takes to answer the prompt.
    pub fn with_prompt_delay(mut self, delay: Duration) -> Self {
        self.prompt_delay = delay;
        self
    }

    pub fn set_outcome(&self, outcome: PromptOutcome) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }

    pub fn probe(&self) -> StreamProbe {
        self.probe.clone()
    }
}

impl Default for SimulatedCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapturePort for SimulatedCapture {
    async fn request_display(
        &self,
        request: &DisplayRequest,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        self.probe.inner.requests.fetch_add(1, Ordering::SeqCst);
        if !self.prompt_delay.is_zero() {
            tokio::time::sleep(self.prompt_delay).await;
        }

        let outcome = *self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let audio = match outcome {
            PromptOutcome::Deny => {
                return Err(CaptureError::PermissionDenied("user declined screen sharing".into()))
            }
            PromptOutcome::Unavailable => {
                return Err(CaptureError::CaptureUnavailable("no display capture support".into()))
            }
            PromptOutcome::Grant => request.audio,
            PromptOutcome::GrantVideoOnly => false,
        };

        let ended = CancellationToken::new();
        *self.probe.inner.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(ended.clone());

        let stream = SimulatedStream {
            id: Uuid::new_v4().to_string(),
            audio,
            ended,
            probe: self.probe.clone(),
        };
        debug!(
            "Simulated display stream {} granted at {}x{} (audio: {})",
            stream.id, request.resolution.width, request.resolution.height, audio
        );
        Ok(Box::new(stream))
    }
}

struct SimulatedStream {
    id: String,
    audio: bool,
    ended: CancellationToken,
    probe: StreamProbe,
}

impl CaptureStream for SimulatedStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_audio(&self) -> bool {
        self.audio
    }

    fn ended(&self) -> CancellationToken {
        self.ended.clone()
    }

    fn stop_tracks(&mut self) {
        self.probe.inner.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct SimulatedEncoder {
    supported: Vec<String>,
    fail_after: Option<u64>,
    last_settings: Mutex<Option<EncoderSettings>>,
}

impl SimulatedEncoder {
    pub fn new() -> Self {
        Self {
            supported: vec!["video/webm;codecs=vp9,opus".into(), "video/webm".into()],
            fail_after: None,
            last_settings: Mutex::new(None),
        }
    }

    pub fn supporting(types: &[&str]) -> Self {
        Self {
            supported: types.iter().map(|t| t.to_string()).collect(),
            ..Self::new()
        }
    }

    /// Emits `fragments` fragments and then reports an encoder error.
    pub fn failing_after(fragments: u64) -> Self {
        Self {
            fail_after: Some(fragments),
            ..Self::new()
        }
    }

    pub fn last_settings(&self) -> Option<EncoderSettings> {
        self.last_settings.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Default for SimulatedEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderPort for SimulatedEncoder {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.supported.iter().any(|t| t == mime_type)
    }

    fn attach(
        &self,
        stream: &dyn CaptureStream,
        settings: &EncoderSettings,
    ) -> Result<EncoderHandle, CaptureError> {
        if settings.fragment_interval.is_zero() {
            return Err(CaptureError::EncoderFailure("fragment interval must be positive".into()));
        }
        *self.last_settings.lock().unwrap_or_else(PoisonError::into_inner) = Some(settings.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let finish = CancellationToken::new();
        let period = settings.fragment_interval;
        let fail_after = self.fail_after;
        let token = finish.clone();
        debug!("Simulated encoder attached to stream {} ({})", stream.id(), settings.mime_type);

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            let mut seq: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        let _ = tx.send(EncoderEvent::Fragment(fragment_bytes(seq + 1)));
                        break;
                    }
                    _ = ticker.tick() => {
                        seq += 1;
                        if fail_after.is_some_and(|n| seq > n) {
                            let _ = tx.send(EncoderEvent::Failed("simulated encoder fault".into()));
                            break;
                        }
                        if tx.send(EncoderEvent::Fragment(fragment_bytes(seq))).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(EncoderHandle {
            events: rx,
            control: Box::new(SimulatedEncoderControl { finish }),
        })
    }
}

struct SimulatedEncoderControl {
    finish: CancellationToken,
}

impl EncoderControl for SimulatedEncoderControl {
    fn finish(&mut self) {
        self.finish.cancel();
    }
}

fn fragment_bytes(seq: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16);
    if seq == 1 {
        bytes.extend_from_slice(&WEBM_MAGIC);
    }
    bytes.extend_from_slice(&CLUSTER_ID);
    bytes.extend_from_slice(&seq.to_be_bytes());
    bytes
}
