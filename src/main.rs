use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use bounty_capture::capture::simulated::{SimulatedCapture, SimulatedEncoder};
use bounty_capture::capture::CaptureSession;
use bounty_capture::config::AppConfig;
use bounty_capture::error::SubmissionError;
use bounty_capture::events::RecorderEvent;
use bounty_capture::pip::HeadlessSurfacePort;
use bounty_capture::submission::{Campaign, MemoryRegistry, SubmissionCoordinator};
use bounty_capture::upload::{LocalStorage, StoragePort, UploadPipeline};

/// Records one simulated campaign attempt into local storage.
#[derive(Parser)]
#[command(name = "bounty-capture")]
#[command(version)]
#[command(about = "Record, upload and register a campaign submission")]
struct Args {
    /// Config file; defaults to the platform config directory.
    #[arg(long, env = "BOUNTY_CAPTURE_CONFIG")]
    config: Option<PathBuf>,

    /// How long to record before stopping.
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    #[arg(long, default_value = "demo-user")]
    user: String,

    #[arg(long, default_value = "demo-campaign")]
    campaign: String,

    #[arg(long, default_value = "https://example.com")]
    target_url: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::load(path),
        None => AppConfig::load_default(),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Unable to load configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };
    bounty_capture::logging::init(&config.logging);

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Submission failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, config: AppConfig) -> Result<(), SubmissionError> {
    let campaign = Campaign {
        id: args.campaign.clone(),
        title: format!("Campaign {}", args.campaign),
        description: "Walk through the target site".to_string(),
        target_url: args.target_url.clone(),
        points_reward: 10,
        max_submissions_per_user: 1,
        is_active: true,
    };

    let storage = Arc::new(LocalStorage::from_config(&config.storage));
    info!("Storing recordings under {}", storage.root().display());

    let session = CaptureSession::new(
        Arc::new(SimulatedCapture::new()),
        Arc::new(SimulatedEncoder::new()),
        config.capture.clone(),
    );
    let mut coordinator = SubmissionCoordinator::new(
        args.user.clone(),
        campaign.clone(),
        session,
        UploadPipeline::new(storage.clone(), config.upload.clone()),
        Arc::new(MemoryRegistry::with_campaign(&campaign)),
    );
    if config.pip.enabled {
        coordinator =
            coordinator.with_mirror(Arc::new(HeadlessSurfacePort::new()), config.pip.width, config.pip.height);
    }

    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let RecorderEvent::UploadProgress { percent } = event {
                info!("Upload {}%", percent);
            }
        }
    });

    coordinator.start_recording().await?;
    tokio::time::sleep(Duration::from_secs(args.seconds) + Duration::from_millis(100)).await;
    let artifact = coordinator.stop_recording().await?;
    info!(
        "Recorded {}s ({} bytes, sha256 {})",
        artifact.duration_seconds(),
        artifact.size(),
        artifact.digest()
    );

    let record = coordinator.submit().await?;
    let link = storage
        .signed_url(&record.storage_reference, config.upload.signed_url_expiry())
        .await
        .map_err(bounty_capture::error::UploadError::from)?;
    info!("Review link {} (expires {})", link.url, link.expires_at);

    drop(coordinator);
    printer.abort();

    match serde_json::to_string_pretty(&record) {
        Ok(json) => println!("{}", json),
        Err(err) => error!("Unable to render submission record: {}", err),
    }
    Ok(())
}
