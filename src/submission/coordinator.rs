use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::capture::{CaptureSession, RecordingArtifact, SessionPhase};
use crate::error::{CaptureError, SubmissionError};
use crate::events::RecorderEvent;
use crate::pip::{FloatingSurfacePort, MirrorContent, PipMirror};
use crate::submission::registry::SubmissionRegistry;
use crate::submission::types::{Campaign, Eligibility, NewSubmission, SubmissionRecord};
use crate::upload::{DestinationKey, StorageReference, UploadPipeline, UploadState};

/// Builds the storage key for one upload attempt from user, campaign and
/// artifact MIME type.
pub type KeyFactory = Arc<dyn Fn(&str, &str, &str) -> DestinationKey + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Recording,
    Uploading,
    Registering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CoordinatorPhase {
    Idle,
    Recording,
    Reviewing,
    Uploading,
    Registering,
    Completed,
    Failed { stage: Stage },
}

impl fmt::Display for CoordinatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorPhase::Idle => f.write_str("idle"),
            CoordinatorPhase::Recording => f.write_str("recording"),
            CoordinatorPhase::Reviewing => f.write_str("reviewing"),
            CoordinatorPhase::Uploading => f.write_str("uploading"),
            CoordinatorPhase::Registering => f.write_str("registering"),
            CoordinatorPhase::Completed => f.write_str("completed"),
            CoordinatorPhase::Failed { stage } => write!(f, "failed ({:?})", stage),
        }
    }
}

struct Cycle {
    phase: CoordinatorPhase,
    artifact: Option<Arc<RecordingArtifact>>,
    reference: Option<StorageReference>,
    record: Option<SubmissionRecord>,
    failure: Option<SubmissionError>,
}

impl Cycle {
    fn fresh() -> Self {
        Self {
            phase: CoordinatorPhase::Idle,
            artifact: None,
            reference: None,
            record: None,
            failure: None,
        }
    }
}

struct MirrorSettings {
    port: Arc<dyn FloatingSurfacePort>,
    width: u32,
    height: u32,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs one campaign attempt end to end: record, review, upload, register.
///
/// The artifact stays in memory until registration succeeds, so a failed
/// upload is retried without recording again and a failed registration is
/// retried without uploading again.
pub struct SubmissionCoordinator {
    user_id: String,
    campaign: Campaign,
    session: CaptureSession,
    pipeline: UploadPipeline,
    registry: Arc<dyn SubmissionRegistry>,
    key_factory: KeyFactory,
    mirror_settings: Option<MirrorSettings>,
    cycle: Mutex<Cycle>,
    mirror: Mutex<Option<PipMirror>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    busy: AtomicBool,
    events: broadcast::Sender<RecorderEvent>,
    upload_state: watch::Sender<UploadState>,
}

impl SubmissionCoordinator {
    pub fn new(
        user_id: impl Into<String>,
        campaign: Campaign,
        session: CaptureSession,
        pipeline: UploadPipeline,
        registry: Arc<dyn SubmissionRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (upload_state, _) = watch::channel(UploadState::default());
        Self {
            user_id: user_id.into(),
            campaign,
            session,
            pipeline,
            registry,
            key_factory: Arc::new(DestinationKey::for_attempt),
            mirror_settings: None,
            cycle: Mutex::new(Cycle::fresh()),
            mirror: Mutex::new(None),
            forwarder: Mutex::new(None),
            busy: AtomicBool::new(false),
            events,
            upload_state,
        }
    }

    /// Opens a floating mirror of the recording when the host supports one.
    pub fn with_mirror(mut self, port: Arc<dyn FloatingSurfacePort>, width: u32, height: u32) -> Self {
        self.mirror_settings = Some(MirrorSettings { port, width, height });
        self
    }

    pub fn with_key_factory(mut self, factory: KeyFactory) -> Self {
        self.key_factory = factory;
        self
    }

    pub fn campaign(&self) -> &Campaign {
        &self.campaign
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.lock().phase
    }

    pub fn artifact(&self) -> Option<Arc<RecordingArtifact>> {
        self.lock().artifact.clone()
    }

    pub fn storage_reference(&self) -> Option<StorageReference> {
        self.lock().reference.clone()
    }

    pub fn record(&self) -> Option<SubmissionRecord> {
        self.lock().record.clone()
    }

    pub fn last_failure(&self) -> Option<SubmissionError> {
        self.lock().failure.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    pub fn upload_state(&self) -> watch::Receiver<UploadState> {
        self.upload_state.subscribe()
    }

    pub fn is_mirror_open(&self) -> bool {
        self.mirror
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(PipMirror::is_open)
    }

    /// Reads the user's existing submission count for this campaign.
    pub async fn eligibility(&self) -> Result<Eligibility, SubmissionError> {
        let existing = self
            .registry
            .submission_count(&self.user_id, &self.campaign.id)
            .await?;
        Ok(Eligibility {
            existing,
            max: self.campaign.max_submissions_per_user,
            active: self.campaign.is_active,
        })
    }

    pub async fn start_recording(&self) -> Result<(), SubmissionError> {
        let _busy = self.begin()?;
        let phase = self.phase();
        match phase {
            CoordinatorPhase::Idle
            | CoordinatorPhase::Completed
            | CoordinatorPhase::Failed { stage: Stage::Recording } => {}
            other => return Err(invalid("start recording", other)),
        }

        let eligibility = self.eligibility().await?;
        if !eligibility.active {
            return Err(SubmissionError::CampaignInactive(self.campaign.id.clone()));
        }
        if !eligibility.allowed() {
            info!(
                "User {} has {} of {} submissions for campaign {}; not recording",
                self.user_id, eligibility.existing, eligibility.max, self.campaign.id
            );
            return Err(SubmissionError::LimitReached {
                existing: eligibility.existing,
                max: eligibility.max,
            });
        }

        self.session.reset().await;
        if let Err(err) = self.session.start().await {
            let err = SubmissionError::from(err);
            self.fail(Stage::Recording, err.clone());
            return Err(err);
        }

        {
            let mut cycle = self.lock();
            *cycle = Cycle::fresh();
            self.set_phase(&mut cycle, CoordinatorPhase::Recording);
        }
        self.upload_state.send_replace(UploadState::default());
        self.spawn_forwarder();
        self.open_mirror().await;
        Ok(())
    }

    /// Stops the recording and moves to review.
    pub async fn stop_recording(&self) -> Result<Arc<RecordingArtifact>, SubmissionError> {
        let _busy = self.begin()?;
        let phase = self.phase();
        if phase != CoordinatorPhase::Recording {
            return Err(invalid("stop recording", phase));
        }
        let artifact = self.session.stop().await;
        self.close_mirror().await;
        self.settle_recording(artifact)
    }

    /// Waits for a recording stopped elsewhere (native chrome, the mirror's
    /// stop control, or an encoder error) and moves to review.
    pub async fn wait_for_recording_end(&self) -> Result<Arc<RecordingArtifact>, SubmissionError> {
        let mut phase = self.session.subscribe_phase();
        let _ = phase
            .wait_for(|p| !matches!(p, SessionPhase::Requesting | SessionPhase::Recording))
            .await;
        let artifact = self.session.stop().await;
        self.close_mirror().await;
        self.settle_recording(artifact)
    }

    /// Throws away the reviewed recording so the user can record again.
    pub async fn discard(&self) -> Result<(), SubmissionError> {
        let _busy = self.begin()?;
        let phase = self.phase();
        match phase {
            CoordinatorPhase::Reviewing
            | CoordinatorPhase::Failed { stage: Stage::Uploading }
            | CoordinatorPhase::Failed { stage: Stage::Registering } => {}
            other => return Err(invalid("discard", other)),
        }
        if let Some(reference) = self.storage_reference() {
            warn!("Discarding recording already uploaded as {}", reference);
        }
        self.session.reset().await;
        let mut cycle = self.lock();
        *cycle = Cycle::fresh();
        self.set_phase(&mut cycle, CoordinatorPhase::Idle);
        Ok(())
    }

    /// Returns from a failure to the stage the user can retry from.
    pub async fn recover(&self) -> Result<CoordinatorPhase, SubmissionError> {
        let _busy = self.begin()?;
        let stage = match self.phase() {
            CoordinatorPhase::Failed { stage } => stage,
            other => return Err(invalid("recover", other)),
        };
        if stage == Stage::Recording {
            self.session.reset().await;
        }
        let mut cycle = self.lock();
        let resume = match stage {
            Stage::Recording => {
                *cycle = Cycle::fresh();
                CoordinatorPhase::Idle
            }
            Stage::Uploading | Stage::Registering => {
                cycle.failure = None;
                CoordinatorPhase::Reviewing
            }
        };
        self.set_phase(&mut cycle, resume);
        Ok(resume)
    }

    /// Uploads the reviewed artifact (unless a previous attempt already did)
    /// and registers the submission.
    pub async fn submit(&self) -> Result<SubmissionRecord, SubmissionError> {
        let _busy = self.begin()?;
        let (artifact, reference) = {
            let cycle = self.lock();
            match cycle.phase {
                CoordinatorPhase::Reviewing
                | CoordinatorPhase::Failed { stage: Stage::Uploading }
                | CoordinatorPhase::Failed { stage: Stage::Registering } => {}
                other => return Err(invalid("submit", other)),
            }
            match cycle.artifact.clone() {
                Some(artifact) => (artifact, cycle.reference.clone()),
                None => return Err(invalid("submit", cycle.phase)),
            }
        };

        let reference = match reference {
            Some(reference) => {
                info!("Reusing uploaded recording {}", reference);
                reference
            }
            None => self.upload(&artifact).await?,
        };

        {
            let mut cycle = self.lock();
            self.set_phase(&mut cycle, CoordinatorPhase::Registering);
        }
        let submission = NewSubmission {
            user_id: self.user_id.clone(),
            campaign_id: self.campaign.id.clone(),
            storage_reference: reference,
            duration_seconds: artifact.duration_seconds(),
        };
        let record = match self.registry.register(submission).await {
            Ok(record) => record,
            Err(err) => {
                let err = SubmissionError::from(err);
                self.fail(Stage::Registering, err.clone());
                return Err(err);
            }
        };

        self.session.reset().await;
        {
            let mut cycle = self.lock();
            cycle.artifact = None;
            cycle.record = Some(record.clone());
            self.set_phase(&mut cycle, CoordinatorPhase::Completed);
        }
        self.emit(RecorderEvent::SubmissionRegistered {
            record: record.clone(),
        });
        Ok(record)
    }

    async fn upload(&self, artifact: &Arc<RecordingArtifact>) -> Result<StorageReference, SubmissionError> {
        {
            let mut cycle = self.lock();
            cycle.failure = None;
            self.set_phase(&mut cycle, CoordinatorPhase::Uploading);
        }
        self.upload_state.send_replace(UploadState::default());

        let key = (self.key_factory)(&self.user_id, &self.campaign.id, artifact.mime_type());
        let result = self
            .pipeline
            .upload(Arc::clone(artifact), key)
            .finish(|state| {
                self.upload_state.send_replace(state.clone());
                self.emit(RecorderEvent::UploadProgress {
                    percent: state.progress_percent,
                });
            })
            .await;

        match result {
            Ok(reference) => {
                self.lock().reference = Some(reference.clone());
                Ok(reference)
            }
            Err(err) => {
                let err = SubmissionError::from(err);
                self.fail(Stage::Uploading, err.clone());
                Err(err)
            }
        }
    }

    fn settle_recording(
        &self,
        artifact: Option<Arc<RecordingArtifact>>,
    ) -> Result<Arc<RecordingArtifact>, SubmissionError> {
        let mut cycle = self.lock();
        if cycle.phase != CoordinatorPhase::Recording {
            // Another caller already settled this recording.
            return match (&cycle.phase, &cycle.artifact) {
                (CoordinatorPhase::Reviewing, Some(artifact)) => Ok(Arc::clone(artifact)),
                (phase, _) => Err(cycle
                    .failure
                    .clone()
                    .unwrap_or_else(|| invalid("finish recording", *phase))),
            };
        }

        match artifact {
            Some(artifact) => {
                cycle.artifact = Some(Arc::clone(&artifact));
                self.set_phase(&mut cycle, CoordinatorPhase::Reviewing);
                self.emit(RecorderEvent::RecordingCompleted {
                    duration_seconds: artifact.duration_seconds(),
                    size_bytes: artifact.size(),
                });
                Ok(artifact)
            }
            None => {
                drop(cycle);
                let err = SubmissionError::from(self.session.last_error().unwrap_or_else(|| {
                    CaptureError::EncoderFailure("recording produced no artifact".into())
                }));
                self.fail(Stage::Recording, err.clone());
                Err(err)
            }
        }
    }

    fn fail(&self, stage: Stage, err: SubmissionError) {
        warn!("Submission for campaign {} failed while {:?}: {}", self.campaign.id, stage, err);
        let event = match stage {
            Stage::Recording => RecorderEvent::RecordingFailed {
                message: err.to_string(),
            },
            Stage::Uploading | Stage::Registering => RecorderEvent::SubmissionFailed {
                message: err.to_string(),
            },
        };
        {
            let mut cycle = self.lock();
            cycle.failure = Some(err);
            self.set_phase(&mut cycle, CoordinatorPhase::Failed { stage });
        }
        self.emit(event);
    }

    async fn open_mirror(&self) {
        let Some(settings) = self.mirror_settings.as_ref() else {
            return;
        };
        let content = MirrorContent {
            instruction: Some(self.campaign.description.clone()),
            target_url: Some(self.campaign.target_url.clone()),
        };
        let mirror = PipMirror::open(
            &self.session,
            settings.port.as_ref(),
            settings.width,
            settings.height,
            content,
        )
        .await;
        *self.mirror.lock().unwrap_or_else(PoisonError::into_inner) = mirror;
    }

    async fn close_mirror(&self) {
        let mirror = self.mirror.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut mirror) = mirror {
            mirror.close().await;
        }
    }

    /// Relays session phase and elapsed time to event subscribers until the
    /// recording ends.
    fn spawn_forwarder(&self) {
        let mut phase_rx = self.session.subscribe_phase();
        let mut elapsed_rx = self.session.subscribe_elapsed();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = phase_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let phase = *phase_rx.borrow_and_update();
                        let _ = events.send(RecorderEvent::RecordingStateChanged { phase });
                        if phase != SessionPhase::Recording {
                            break;
                        }
                    }
                    changed = elapsed_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let elapsed_seconds = *elapsed_rx.borrow_and_update();
                        let _ = events.send(RecorderEvent::RecordingDuration { elapsed_seconds });
                    }
                }
            }
        });
        let previous = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn begin(&self) -> Result<BusyGuard<'_>, SubmissionError> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| BusyGuard(&self.busy))
            .map_err(|_| SubmissionError::Busy)
    }

    fn lock(&self) -> MutexGuard<'_, Cycle> {
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, cycle: &mut Cycle, phase: CoordinatorPhase) {
        if cycle.phase != phase {
            debug!("Submission {} -> {}", cycle.phase, phase);
            cycle.phase = phase;
            self.emit(RecorderEvent::SubmissionStateChanged { phase });
        }
    }

    fn emit(&self, event: RecorderEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for SubmissionCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self
            .forwarder
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

fn invalid(action: &'static str, phase: CoordinatorPhase) -> SubmissionError {
    SubmissionError::InvalidTransition {
        action,
        phase: phase.to_string(),
    }
}
