use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use bounty_capture::capture::simulated::{SimulatedCapture, SimulatedEncoder};
use bounty_capture::capture::{CaptureConfig, CaptureSession, SessionPhase};
use bounty_capture::error::{StorageError, SubmissionError, UploadError};
use bounty_capture::pip::HeadlessSurfacePort;
use bounty_capture::submission::{
    Campaign, CoordinatorPhase, KeyFactory, MemoryRegistry, NewSubmission, Stage, SubmissionCoordinator,
    SubmissionRecord, SubmissionStatus,
};
use bounty_capture::upload::{
    DestinationKey, MemoryStorage, SignedUrl, StoragePort, StorageReference, UploadConfig,
    UploadPipeline, WriteMode,
};

fn campaign(max: u32) -> Campaign {
    Campaign {
        id: "c1".into(),
        title: "Onboarding".into(),
        description: "Sign up and complete the tour".into(),
        target_url: "https://app.example.com/signup".into(),
        points_reward: 250,
        max_submissions_per_user: max,
        is_active: true,
    }
}

fn fixed_key() -> KeyFactory {
    Arc::new(|user: &str, campaign: &str, mime: &str| DestinationKey::with_name(user, campaign, "abc", mime))
}

fn session() -> CaptureSession {
    CaptureSession::new(
        Arc::new(SimulatedCapture::new()),
        Arc::new(SimulatedEncoder::new()),
        CaptureConfig::default(),
    )
}

/// Storage that fails the first `failures` puts with a transport error.
struct FlakyStorage {
    inner: MemoryStorage,
    failures: AtomicUsize,
}

impl FlakyStorage {
    fn failing(failures: usize) -> Self {
        Self {
            inner: MemoryStorage::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl StoragePort for FlakyStorage {
    async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        mode: WriteMode,
    ) -> Result<StorageReference, StorageError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Transport("connection reset".into()));
        }
        self.inner.put(path, bytes, content_type, mode).await
    }

    async fn signed_url(
        &self,
        reference: &StorageReference,
        expiry: Duration,
    ) -> Result<SignedUrl, StorageError> {
        self.inner.signed_url(reference, expiry).await
    }
}

#[tokio::test(start_paused = true)]
async fn five_second_recording_is_registered_as_pending() {
    let storage = Arc::new(MemoryStorage::new());
    let c = campaign(1);
    let registry = Arc::new(MemoryRegistry::with_campaign(&c));
    let coordinator = SubmissionCoordinator::new(
        "u1",
        c,
        session(),
        UploadPipeline::new(storage.clone(), UploadConfig::default()),
        registry.clone(),
    )
    .with_key_factory(fixed_key());

    coordinator.start_recording().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5_200)).await;
    let artifact = coordinator.stop_recording().await.unwrap();
    assert_eq!(artifact.duration_seconds(), 5);
    assert_eq!(artifact.mime_type(), "video/webm");

    let record = coordinator.submit().await.unwrap();
    assert_eq!(record.storage_reference.as_str(), "u1/c1/abc.webm");
    assert_eq!(record.status, SubmissionStatus::Pending);
    assert_eq!(record.duration_seconds, 5);
    assert_eq!(record.points_awarded, 0);

    let stored = storage.get("u1/c1/abc.webm").expect("uploaded");
    assert_eq!(stored.bytes, artifact.bytes());
    assert_eq!(registry.records(), vec![record]);
    assert_eq!(coordinator.phase(), CoordinatorPhase::Completed);
    assert_eq!(coordinator.session().phase(), SessionPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn transport_error_keeps_artifact_for_retry() {
    let storage = Arc::new(FlakyStorage::failing(1));
    let c = campaign(1);
    let coordinator = SubmissionCoordinator::new(
        "u1",
        c.clone(),
        session(),
        UploadPipeline::new(storage.clone(), UploadConfig::default()),
        Arc::new(MemoryRegistry::with_campaign(&c)),
    )
    .with_key_factory(fixed_key());

    coordinator.start_recording().await.unwrap();
    tokio::time::sleep(Duration::from_millis(3_200)).await;
    let artifact = coordinator.stop_recording().await.unwrap();

    let err = coordinator.submit().await.unwrap_err();
    assert!(matches!(
        err,
        SubmissionError::Upload(UploadError::UploadTransportError(StorageError::Transport(_)))
    ));
    assert_eq!(
        coordinator.phase(),
        CoordinatorPhase::Failed { stage: Stage::Uploading }
    );
    assert!(coordinator.storage_reference().is_none());

    assert_eq!(coordinator.recover().await.unwrap(), CoordinatorPhase::Reviewing);
    assert!(Arc::ptr_eq(&coordinator.artifact().unwrap(), &artifact));

    let record = coordinator.submit().await.unwrap();
    assert_eq!(record.storage_reference.as_str(), "u1/c1/abc.webm");
    assert_eq!(record.duration_seconds, 3);
    assert_eq!(storage.inner.len(), 1);
}

fn seeded_registry(c: &Campaign, existing: usize) -> Arc<MemoryRegistry> {
    let registry = Arc::new(MemoryRegistry::with_campaign(c));
    for i in 0..existing {
        registry.seed(SubmissionRecord::pending(NewSubmission {
            user_id: "u1".into(),
            campaign_id: c.id.clone(),
            storage_reference: StorageReference::new(format!("u1/c1/earlier-{}.webm", i)),
            duration_seconds: 10,
        }));
    }
    registry
}

#[tokio::test(start_paused = true)]
async fn submission_limit_is_enforced_before_capture() {
    let c = campaign(1);
    let capture = Arc::new(SimulatedCapture::new());
    let coordinator = SubmissionCoordinator::new(
        "u1",
        c.clone(),
        CaptureSession::new(capture.clone(), Arc::new(SimulatedEncoder::new()), CaptureConfig::default()),
        UploadPipeline::new(Arc::new(MemoryStorage::new()), UploadConfig::default()),
        seeded_registry(&c, 1),
    );
    assert_eq!(
        coordinator.start_recording().await,
        Err(SubmissionError::LimitReached { existing: 1, max: 1 })
    );
    assert_eq!(capture.probe().requests(), 0);

    let c = campaign(3);
    let coordinator = SubmissionCoordinator::new(
        "u1",
        c.clone(),
        session(),
        UploadPipeline::new(Arc::new(MemoryStorage::new()), UploadConfig::default()),
        seeded_registry(&c, 2),
    );
    let eligibility = coordinator.eligibility().await.unwrap();
    assert!(eligibility.allowed());
    assert_eq!(eligibility.remaining(), 1);
    coordinator.start_recording().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stopping_from_the_mirror_ends_the_recording() {
    let surface = Arc::new(HeadlessSurfacePort::new());
    let probe = surface.probe();
    let c = campaign(1);
    let coordinator = SubmissionCoordinator::new(
        "u1",
        c.clone(),
        session(),
        UploadPipeline::new(Arc::new(MemoryStorage::new()), UploadConfig::default()),
        Arc::new(MemoryRegistry::with_campaign(&c)),
    )
    .with_mirror(surface, 320, 240);

    coordinator.start_recording().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2_200)).await;
    let view = probe.last_render().expect("rendered");
    assert!(view.recording);
    assert_eq!(view.elapsed_label, "0:02");

    probe.press_stop();
    let artifact = coordinator.wait_for_recording_end().await.unwrap();
    assert_eq!(artifact.duration_seconds(), 2);
    assert_eq!(coordinator.phase(), CoordinatorPhase::Reviewing);
    assert!(!coordinator.is_mirror_open());
    assert_eq!(probe.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn recording_works_without_a_floating_surface() {
    let c = campaign(1);
    let coordinator = SubmissionCoordinator::new(
        "u1",
        c.clone(),
        session(),
        UploadPipeline::new(Arc::new(MemoryStorage::new()), UploadConfig::default()),
        Arc::new(MemoryRegistry::with_campaign(&c)),
    )
    .with_mirror(Arc::new(HeadlessSurfacePort::unsupported()), 320, 240);

    coordinator.start_recording().await.unwrap();
    assert!(!coordinator.is_mirror_open());
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let artifact = coordinator.stop_recording().await.unwrap();
    assert_eq!(artifact.duration_seconds(), 1);
}
