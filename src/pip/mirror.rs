use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureSession, SessionPhase};
use crate::error::SurfaceError;
use crate::pip::format::format_duration;

/// Everything the floating surface shows at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorView {
    pub recording: bool,
    pub elapsed_seconds: u64,
    pub elapsed_label: String,
    pub instruction: Option<String>,
    pub target_url: Option<String>,
}

/// Static task details shown next to the timer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorContent {
    pub instruction: Option<String>,
    pub target_url: Option<String>,
}

#[async_trait]
pub trait FloatingSurfacePort: Send + Sync {
    fn is_supported(&self) -> bool;

    async fn request_surface(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn FloatingSurface>, SurfaceError>;
}

/// An always-on-top window owned by the mirror task.
pub trait FloatingSurface: Send {
    fn render(&mut self, view: &MirrorView);

    /// Cancelled when the user activates the stop control.
    fn stop_activated(&self) -> CancellationToken;

    /// Cancelled when the host tears the surface down on its own.
    fn host_closed(&self) -> CancellationToken;

    fn close(&mut self);
}

/// Live view of a recording in a floating surface.
///
/// Purely an enhancement: when the host cannot provide a surface, `open`
/// returns `None` and recording carries on untouched.
pub struct PipMirror {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PipMirror {
    pub async fn open(
        session: &CaptureSession,
        port: &dyn FloatingSurfacePort,
        width: u32,
        height: u32,
        content: MirrorContent,
    ) -> Option<Self> {
        if !port.is_supported() {
            debug!("Floating surface not supported by host; skipping mirror");
            return None;
        }
        let surface = match port.request_surface(width, height).await {
            Ok(surface) => surface,
            Err(err) => {
                warn!("Failed to open floating surface: {}", err);
                return None;
            }
        };
        info!("Recording mirror opened ({}x{})", width, height);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_mirror(
            surface,
            session.clone(),
            content,
            shutdown.clone(),
        ));
        Some(Self {
            shutdown,
            task: Some(task),
        })
    }

    pub fn is_open(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Closes the surface if it is still open. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Waits until the mirror has closed for any reason.
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
    }
}

impl Drop for PipMirror {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn view(phase: SessionPhase, elapsed: u64, content: &MirrorContent) -> MirrorView {
    MirrorView {
        recording: phase == SessionPhase::Recording,
        elapsed_seconds: elapsed,
        elapsed_label: format_duration(elapsed),
        instruction: content.instruction.clone(),
        target_url: content.target_url.clone(),
    }
}

async fn run_mirror(
    mut surface: Box<dyn FloatingSurface>,
    session: CaptureSession,
    content: MirrorContent,
    shutdown: CancellationToken,
) {
    let mut phase_rx = session.subscribe_phase();
    let mut elapsed_rx = session.subscribe_elapsed();
    let stop = surface.stop_activated();
    let host_closed = surface.host_closed();

    loop {
        let phase = *phase_rx.borrow_and_update();
        if phase != SessionPhase::Recording {
            debug!("Session is {}; closing mirror", phase);
            break;
        }
        let elapsed = *elapsed_rx.borrow_and_update();
        surface.render(&view(phase, elapsed, &content));

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = host_closed.cancelled() => {
                debug!("Mirror surface closed by host");
                return;
            }
            _ = stop.cancelled() => {
                info!("Stop activated from recording mirror");
                session.stop().await;
                break;
            }
            changed = elapsed_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = phase_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    surface.close();
}
