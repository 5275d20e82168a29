use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capture::RecordingArtifact;
use crate::error::{StorageError, UploadError};
use crate::upload::storage::{DestinationKey, StoragePort, StorageReference, WriteMode};

/// Reported once the transfer has been handed to storage.
pub const PROGRESS_STARTED: u8 = 10;
/// Reported once storage has confirmed the object.
pub const PROGRESS_DONE: u8 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub timeout_secs: u64,
    pub write_mode: WriteMode,
    pub signed_url_expiry_secs: u64,
}

impl UploadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn signed_url_expiry(&self) -> Duration {
        Duration::from_secs(self.signed_url_expiry_secs)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            write_mode: WriteMode::CreateNew,
            signed_url_expiry_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Progress(u8),
    Completed(StorageReference),
    Failed(UploadError),
}

impl UploadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadEvent::Progress(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPhase {
    #[default]
    Idle,
    Uploading,
    Done,
    Failed,
}

/// Progress of one upload attempt. A retry starts from a fresh value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadState {
    pub phase: UploadPhase,
    pub progress_percent: u8,
    pub storage_reference: Option<StorageReference>,
    pub error: Option<UploadError>,
}

impl UploadState {
    pub fn apply(&mut self, event: &UploadEvent) {
        match event {
            UploadEvent::Progress(pct) => {
                self.phase = UploadPhase::Uploading;
                self.progress_percent = self.progress_percent.max((*pct).min(PROGRESS_DONE));
            }
            UploadEvent::Completed(reference) => {
                self.phase = UploadPhase::Done;
                self.progress_percent = PROGRESS_DONE;
                self.storage_reference = Some(reference.clone());
            }
            UploadEvent::Failed(err) => {
                self.phase = UploadPhase::Failed;
                self.error = Some(err.clone());
            }
        }
    }
}

/// A running upload. Events end with exactly one `Completed` or `Failed`.
pub struct UploadHandle {
    key: DestinationKey,
    events: mpsc::Receiver<UploadEvent>,
    abort: CancellationToken,
    finished: bool,
}

impl UploadHandle {
    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    /// Cancels the transfer. The only event still delivered afterwards is
    /// the terminal failure.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub async fn next_event(&mut self) -> Option<UploadEvent> {
        if self.finished {
            return None;
        }
        let event = loop {
            let event = self.events.recv().await;
            if !self.abort.is_cancelled() {
                break event.unwrap_or_else(|| {
                    UploadEvent::Failed(UploadError::UploadTransportError(StorageError::Transport(
                        "upload task ended without a result".into(),
                    )))
                });
            }
            // Aborted: drop buffered progress and report the abort as the outcome.
            match event {
                Some(UploadEvent::Progress(_)) => continue,
                _ => break UploadEvent::Failed(UploadError::Aborted),
            }
        };
        self.finished = event.is_terminal();
        Some(event)
    }

    /// Drives the upload to its end, handing every state change to
    /// `on_update`.
    pub async fn finish<F>(mut self, mut on_update: F) -> Result<StorageReference, UploadError>
    where
        F: FnMut(&UploadState),
    {
        let mut state = UploadState::default();
        while let Some(event) = self.next_event().await {
            state.apply(&event);
            on_update(&state);
            match event {
                UploadEvent::Completed(reference) => return Ok(reference),
                UploadEvent::Failed(err) => return Err(err),
                UploadEvent::Progress(_) => {}
            }
        }
        Err(UploadError::Aborted)
    }
}

/// Hands finished artifacts to storage under a deadline.
#[derive(Clone)]
pub struct UploadPipeline {
    storage: Arc<dyn StoragePort>,
    config: UploadConfig,
}

impl UploadPipeline {
    pub fn new(storage: Arc<dyn StoragePort>, config: UploadConfig) -> Self {
        Self { storage, config }
    }

    pub fn storage(&self) -> &Arc<dyn StoragePort> {
        &self.storage
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn upload(&self, artifact: Arc<RecordingArtifact>, key: DestinationKey) -> UploadHandle {
        let (tx, rx) = mpsc::channel(8);
        let abort = CancellationToken::new();
        let transfer = Transfer {
            storage: Arc::clone(&self.storage),
            artifact,
            key: key.clone(),
            timeout: self.config.timeout(),
            mode: self.config.write_mode,
            events: tx,
            last_progress: 0,
        };
        tokio::spawn(transfer.run(abort.clone()));
        UploadHandle {
            key,
            events: rx,
            abort,
            finished: false,
        }
    }
}

struct Transfer {
    storage: Arc<dyn StoragePort>,
    artifact: Arc<RecordingArtifact>,
    key: DestinationKey,
    timeout: Duration,
    mode: WriteMode,
    events: mpsc::Sender<UploadEvent>,
    last_progress: u8,
}

impl Transfer {
    async fn run(mut self, abort: CancellationToken) {
        if abort.is_cancelled() {
            self.emit(UploadEvent::Failed(UploadError::Aborted)).await;
            return;
        }
        info!(
            "Uploading {} ({} bytes, sha256 {})",
            self.key,
            self.artifact.size(),
            self.artifact.digest()
        );
        self.progress(PROGRESS_STARTED).await;

        let put = self.storage.put(
            self.key.as_str(),
            self.artifact.bytes(),
            self.artifact.mime_type(),
            self.mode,
        );
        // Dropping `put` on abort or timeout cancels the in-flight request.
        let outcome = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(UploadError::Aborted),
            result = tokio::time::timeout(self.timeout, put) => match result {
                Ok(Ok(reference)) => Ok(reference),
                Ok(Err(err)) => Err(UploadError::UploadTransportError(err)),
                Err(_) => Err(UploadError::UploadTimeout(self.timeout.as_secs())),
            },
        };

        match outcome {
            Ok(reference) if abort.is_cancelled() => {
                warn!("Upload aborted after {} was already stored", reference);
                self.emit(UploadEvent::Failed(UploadError::Aborted)).await;
            }
            Ok(reference) => {
                info!("Upload of {} complete", reference);
                self.progress(PROGRESS_DONE).await;
                self.emit(UploadEvent::Completed(reference)).await;
            }
            Err(err) => {
                warn!("Upload of {} failed: {}", self.key, err);
                self.emit(UploadEvent::Failed(err)).await;
            }
        }
    }

    async fn progress(&mut self, percent: u8) {
        if percent <= self.last_progress {
            return;
        }
        self.last_progress = percent;
        debug!("Upload {} at {}%", self.key, percent);
        self.emit(UploadEvent::Progress(percent)).await;
    }

    async fn emit(&self, event: UploadEvent) {
        // A dropped handle just means nobody is listening any more.
        let _ = self.events.send(event).await;
    }
}
