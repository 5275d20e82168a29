use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::capture::artifact::RecordingArtifact;
use crate::capture::config::{container_type, CaptureConfig, DisplayRequest, EncoderSettings};
use crate::capture::ports::{CapturePort, CaptureStream, EncoderEvent, EncoderHandle, EncoderPort};
use crate::error::CaptureError;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Requesting,
    Recording,
    Stopped,
    Errored,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Requesting => "requesting",
            SessionPhase::Recording => "recording",
            SessionPhase::Stopped => "stopped",
            SessionPhase::Errored => "errored",
        };
        f.write_str(s)
    }
}

struct DriverHandle {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

struct SessionState {
    phase: SessionPhase,
    artifact: Option<Arc<RecordingArtifact>>,
    last_error: Option<CaptureError>,
    driver: Option<DriverHandle>,
}

struct Shared {
    state: Mutex<SessionState>,
    phase_tx: watch::Sender<SessionPhase>,
    elapsed_tx: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, state: &mut SessionState, phase: SessionPhase) {
        if state.phase != phase {
            debug!("Capture session {} -> {}", state.phase, phase);
        }
        state.phase = phase;
        self.phase_tx.send_replace(phase);
    }
}

/// Cancels its token when the last session handle goes away. The driver
/// only holds a clone of the token, never the guard.
struct HandleGuard(CancellationToken);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// One screen-recording attempt at a time: prompt, encode, time, finalize.
///
/// Cloning yields another handle to the same session. The capture stream,
/// encoder and timer live inside a single driver task, which is the only
/// place they are released. Dropping the last handle while recording
/// stops the recording through the same teardown.
#[derive(Clone)]
pub struct CaptureSession {
    capture: Arc<dyn CapturePort>,
    encoder: Arc<dyn EncoderPort>,
    config: Arc<CaptureConfig>,
    shared: Arc<Shared>,
    handles: Arc<HandleGuard>,
}

impl CaptureSession {
    pub fn new(
        capture: Arc<dyn CapturePort>,
        encoder: Arc<dyn EncoderPort>,
        config: CaptureConfig,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Idle);
        let (elapsed_tx, _) = watch::channel(0);
        Self {
            capture,
            encoder,
            config: Arc::new(config),
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState {
                    phase: SessionPhase::Idle,
                    artifact: None,
                    last_error: None,
                    driver: None,
                }),
                phase_tx,
                elapsed_tx,
            }),
            handles: Arc::new(HandleGuard(CancellationToken::new())),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.lock().phase
    }

    pub fn elapsed_seconds(&self) -> u64 {
        *self.shared.elapsed_tx.borrow()
    }

    pub fn artifact(&self) -> Option<Arc<RecordingArtifact>> {
        self.shared.lock().artifact.clone()
    }

    pub fn last_error(&self) -> Option<CaptureError> {
        self.shared.lock().last_error.clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.shared.phase_tx.subscribe()
    }

    pub fn subscribe_elapsed(&self) -> watch::Receiver<u64> {
        self.shared.elapsed_tx.subscribe()
    }

    /// Prompts for a display stream and begins recording.
    ///
    /// A declined or unavailable prompt leaves the session `Idle` so the
    /// caller can simply try again.
    pub async fn start(&self) -> Result<(), CaptureError> {
        {
            let mut state = self.shared.lock();
            match state.phase {
                SessionPhase::Requesting | SessionPhase::Recording => {
                    return Err(CaptureError::AlreadyRecording)
                }
                SessionPhase::Stopped => return Err(CaptureError::ArtifactPending),
                SessionPhase::Idle | SessionPhase::Errored => {}
            }
            state.last_error = None;
            self.shared.set_phase(&mut state, SessionPhase::Requesting);
        }
        self.shared.elapsed_tx.send_replace(0);

        let request = DisplayRequest {
            resolution: self.config.resolution,
            audio: self.config.include_audio,
        };
        let mut stream = match self.capture.request_display(&request).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Display capture request failed: {}", err);
                let mut state = self.shared.lock();
                state.last_error = Some(err.clone());
                self.shared.set_phase(&mut state, SessionPhase::Idle);
                return Err(err);
            }
        };
        if request.audio && !stream.has_audio() {
            info!("Display stream {} granted without audio", stream.id());
        }

        let settings = EncoderSettings {
            mime_type: self.select_mime_type(),
            video_bits_per_second: self.config.video_bits_per_second,
            fragment_interval: self.config.fragment_interval(),
        };
        let encoder = match self.encoder.attach(stream.as_ref(), &settings) {
            Ok(encoder) => encoder,
            Err(err) => {
                error!("Failed to attach encoder ({}): {}", settings.mime_type, err);
                stream.stop_tracks();
                let mut state = self.shared.lock();
                state.last_error = Some(err.clone());
                self.shared.set_phase(&mut state, SessionPhase::Errored);
                return Err(err);
            }
        };

        info!(
            "Recording started on stream {} ({}, {} bps)",
            stream.id(),
            settings.mime_type,
            settings.video_bits_per_second
        );
        let driver = Driver {
            shared: Arc::clone(&self.shared),
            stream,
            encoder,
            mime_type: container_type(&settings.mime_type).to_string(),
            finalize_timeout: self.config.finalize_timeout(),
            abandoned: self.handles.0.clone(),
        };
        let (stop_tx, stop_rx) = oneshot::channel();

        let mut state = self.shared.lock();
        self.shared.set_phase(&mut state, SessionPhase::Recording);
        let join = tokio::spawn(driver.run(stop_rx));
        state.driver = Some(DriverHandle { stop_tx, join });
        Ok(())
    }

    /// Finalizes the recording and returns the artifact.
    ///
    /// Calling it when not recording is a no-op that returns whatever
    /// artifact the session already holds. `None` after a recording means
    /// finalization failed; see [`CaptureSession::last_error`].
    pub async fn stop(&self) -> Option<Arc<RecordingArtifact>> {
        let driver = {
            let mut state = self.shared.lock();
            if state.phase != SessionPhase::Recording {
                return state.artifact.clone();
            }
            state.driver.take()
        };

        match driver {
            Some(DriverHandle { stop_tx, join }) => {
                // The driver may already be tearing down after a track end.
                let _ = stop_tx.send(());
                if let Err(err) = join.await {
                    error!("Capture driver terminated abnormally: {}", err);
                    let mut state = self.shared.lock();
                    if state.phase == SessionPhase::Recording {
                        state.last_error =
                            Some(CaptureError::EncoderFailure("capture driver terminated".into()));
                        self.shared.set_phase(&mut state, SessionPhase::Errored);
                    }
                }
            }
            None => {
                let mut phase = self.subscribe_phase();
                let _ = phase.wait_for(|p| *p != SessionPhase::Recording).await;
            }
        }
        self.artifact()
    }

    /// Drops the artifact and elapsed time so the next `start()` begins
    /// from a clean slate. A live recording is stopped and discarded.
    pub async fn reset(&self) {
        if self.phase() == SessionPhase::Recording {
            self.stop().await;
        }
        let mut state = self.shared.lock();
        match state.phase {
            SessionPhase::Requesting | SessionPhase::Recording => {
                debug!("Ignoring reset while {}", state.phase);
            }
            _ => {
                state.artifact = None;
                state.last_error = None;
                self.shared.set_phase(&mut state, SessionPhase::Idle);
                self.shared.elapsed_tx.send_replace(0);
            }
        }
    }

    fn select_mime_type(&self) -> String {
        self.config
            .preferred_mime_types
            .iter()
            .find(|mime| self.encoder.is_type_supported(mime))
            .cloned()
            .unwrap_or_else(|| self.config.fallback_mime_type.clone())
    }
}

enum Teardown {
    Requested,
    Abandoned,
    TrackEnded,
    EncoderFailed(String),
}

struct Driver {
    shared: Arc<Shared>,
    stream: Box<dyn CaptureStream>,
    encoder: EncoderHandle,
    mime_type: String,
    finalize_timeout: Duration,
    abandoned: CancellationToken,
}

impl Driver {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        let ended = self.stream.ended();
        let abandoned = self.abandoned.clone();
        let mut timer = interval_at(Instant::now() + TICK, TICK);
        let mut elapsed: u64 = 0;
        let mut fragments: Vec<Vec<u8>> = Vec::new();

        let reason = loop {
            tokio::select! {
                // Ticks first: a tick due at the same instant as a stop
                // request still counts.
                biased;
                _ = timer.tick() => {
                    elapsed += 1;
                    self.shared.elapsed_tx.send_replace(elapsed);
                }
                event = self.encoder.events.recv() => match event {
                    Some(EncoderEvent::Fragment(bytes)) => {
                        if !bytes.is_empty() {
                            fragments.push(bytes);
                        }
                    }
                    Some(EncoderEvent::Failed(message)) => break Teardown::EncoderFailed(message),
                    None => break Teardown::EncoderFailed("encoder closed unexpectedly".into()),
                },
                _ = &mut stop_rx => break Teardown::Requested,
                _ = ended.cancelled() => break Teardown::TrackEnded,
                _ = abandoned.cancelled() => break Teardown::Abandoned,
            }
        };
        drop(timer);

        let outcome = match reason {
            Teardown::Requested | Teardown::TrackEnded | Teardown::Abandoned => {
                match reason {
                    Teardown::TrackEnded => info!("Capture track ended by the host; stopping recording"),
                    Teardown::Abandoned => warn!("Capture session dropped while recording; stopping"),
                    _ => {}
                }
                self.encoder.control.finish();
                match timeout(self.finalize_timeout, drain(&mut self.encoder, &mut fragments)).await {
                    Ok(result) => result,
                    Err(_) => Err(CaptureError::EncoderFailure(
                        "encoder did not finalize in time".into(),
                    )),
                }
            }
            Teardown::EncoderFailed(message) => Err(CaptureError::EncoderFailure(message)),
        };
        self.stream.stop_tracks();

        let mut state = self.shared.lock();
        state.driver = None;
        match outcome {
            Ok(()) => {
                let artifact =
                    RecordingArtifact::from_fragments(fragments, self.mime_type.clone(), elapsed);
                info!(
                    "Recording finalized: {}s, {} bytes, sha256 {}",
                    artifact.duration_seconds(),
                    artifact.size(),
                    artifact.digest()
                );
                state.artifact = Some(Arc::new(artifact));
                self.shared.set_phase(&mut state, SessionPhase::Stopped);
            }
            Err(err) => {
                error!("Recording failed after {}s: {}", elapsed, err);
                state.last_error = Some(err);
                self.shared.set_phase(&mut state, SessionPhase::Errored);
            }
        }
    }
}

async fn drain(encoder: &mut EncoderHandle, fragments: &mut Vec<Vec<u8>>) -> Result<(), CaptureError> {
    while let Some(event) = encoder.events.recv().await {
        match event {
            EncoderEvent::Fragment(bytes) if !bytes.is_empty() => fragments.push(bytes),
            EncoderEvent::Fragment(_) => {}
            EncoderEvent::Failed(message) => return Err(CaptureError::EncoderFailure(message)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::simulated::{PromptOutcome, SimulatedCapture, SimulatedEncoder, WEBM_MAGIC};

    fn session_with(capture: Arc<SimulatedCapture>, encoder: Arc<SimulatedEncoder>) -> CaptureSession {
        CaptureSession::new(capture, encoder, CaptureConfig::default())
    }

    fn simulated() -> (CaptureSession, Arc<SimulatedCapture>, Arc<SimulatedEncoder>) {
        let capture = Arc::new(SimulatedCapture::new());
        let encoder = Arc::new(SimulatedEncoder::new());
        (session_with(capture.clone(), encoder.clone()), capture, encoder)
    }

    #[tokio::test(start_paused = true)]
    async fn duration_matches_session_timer() {
        let (session, _, _) = simulated();
        session.start().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Recording);

        tokio::time::sleep(Duration::from_millis(5_200)).await;
        assert_eq!(session.elapsed_seconds(), 5);

        let artifact = session.stop().await.expect("artifact");
        assert_eq!(artifact.duration_seconds(), 5);
        assert_eq!(artifact.mime_type(), "video/webm");
        assert!(artifact.bytes().starts_with(&WEBM_MAGIC));
        assert_eq!(session.phase(), SessionPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_twice_releases_once() {
        let (session, capture, _) = simulated();
        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let first = session.stop().await.expect("artifact");
        let second = session.stop().await.expect("artifact");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(capture.probe().releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stops_share_one_teardown() {
        let (session, capture, _) = simulated();
        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let (a, b) = tokio::join!(session.stop(), session.stop());
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(capture.probe().releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn track_end_auto_stops() {
        let (session, capture, _) = simulated();
        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_300)).await;

        let mut phase = session.subscribe_phase();
        capture.probe().end_track();
        phase.wait_for(|p| *p == SessionPhase::Stopped).await.unwrap();

        let artifact = session.artifact().expect("artifact");
        assert_eq!(artifact.duration_seconds(), 3);
        assert_eq!(capture.probe().releases(), 1);

        let again = session.stop().await.expect("artifact");
        assert!(Arc::ptr_eq(&artifact, &again));
        assert_eq!(capture.probe().releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_last_handle_releases_tracks() {
        let (session, capture, _) = simulated();
        session.start().await.unwrap();
        let mut phase = session.subscribe_phase();
        let elapsed = session.subscribe_elapsed();
        tokio::time::sleep(Duration::from_millis(2_200)).await;

        drop(session);
        phase.wait_for(|p| *p == SessionPhase::Stopped).await.unwrap();
        assert_eq!(capture.probe().releases(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*elapsed.borrow(), 2);
        assert_eq!(capture.probe().releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_one_clone_keeps_recording() {
        let (session, capture, _) = simulated();
        let other = session.clone();
        session.start().await.unwrap();
        drop(session);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(other.phase(), SessionPhase::Recording);
        assert_eq!(capture.probe().releases(), 0);
        assert_eq!(other.stop().await.expect("artifact").duration_seconds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_stays_idle_and_can_retry() {
        let capture = Arc::new(SimulatedCapture::with_outcome(PromptOutcome::Deny));
        let session = session_with(capture.clone(), Arc::new(SimulatedEncoder::new()));

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert_eq!(session.last_error(), Some(err));

        capture.set_outcome(PromptOutcome::Grant);
        session.start().await.unwrap();
        assert_eq!(capture.probe().requests(), 2);
        assert_eq!(session.last_error(), None);
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_capture_is_reported() {
        let capture = Arc::new(SimulatedCapture::with_outcome(PromptOutcome::Unavailable));
        let session = session_with(capture, Arc::new(SimulatedEncoder::new()));
        assert!(matches!(
            session.start().await,
            Err(CaptureError::CaptureUnavailable(_))
        ));
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn encoder_failure_is_terminal() {
        let capture = Arc::new(SimulatedCapture::new());
        let session = session_with(capture.clone(), Arc::new(SimulatedEncoder::failing_after(2)));
        session.start().await.unwrap();

        let mut phase = session.subscribe_phase();
        phase.wait_for(|p| *p == SessionPhase::Errored).await.unwrap();
        assert!(matches!(session.last_error(), Some(CaptureError::EncoderFailure(_))));
        assert!(session.artifact().is_none());
        assert_eq!(capture.probe().releases(), 1);

        assert!(session.stop().await.is_none());
        assert_eq!(capture.probe().releases(), 1);

        // a fresh attempt is allowed from the errored state
        session.start().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Recording);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_rejected_while_busy_or_pending() {
        let (session, _, _) = simulated();
        session.start().await.unwrap();
        assert_eq!(session.start().await, Err(CaptureError::AlreadyRecording));

        session.stop().await;
        assert_eq!(session.start().await, Err(CaptureError::ArtifactPending));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_after_stop_matches_fresh_session() {
        let (session, capture, _) = simulated();
        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        session.stop().await.expect("artifact");

        session.reset().await;
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert_eq!(session.elapsed_seconds(), 0);
        assert!(session.artifact().is_none());
        assert!(session.last_error().is_none());

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let artifact = session.stop().await.expect("artifact");
        assert_eq!(artifact.duration_seconds(), 1);
        assert_eq!(capture.probe().releases(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_while_recording_discards() {
        let (session, capture, _) = simulated();
        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        session.reset().await;
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.artifact().is_none());
        assert_eq!(capture.probe().releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn preferred_mime_type_falls_back() {
        let capture = Arc::new(SimulatedCapture::new());
        let encoder = Arc::new(SimulatedEncoder::supporting(&["video/webm"]));
        let session = session_with(capture, encoder.clone());
        session.start().await.unwrap();

        let settings = encoder.last_settings().unwrap();
        assert_eq!(settings.mime_type, "video/webm");
        assert_eq!(settings.video_bits_per_second, 2_500_000);
        session.stop().await;
    }
}
