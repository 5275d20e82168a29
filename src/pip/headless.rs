use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::info;
use tokio_util::sync::CancellationToken;

use crate::error::SurfaceError;
use crate::pip::mirror::{FloatingSurface, FloatingSurfacePort, MirrorView};

/// Floating surface for hosts without a window system. Writes each frame to
/// the log and keeps the latest one for inspection.
pub struct HeadlessSurfacePort {
    supported: bool,
    probe: SurfaceProbe,
}

impl HeadlessSurfacePort {
    pub fn new() -> Self {
        Self {
            supported: true,
            probe: SurfaceProbe::default(),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            supported: false,
            probe: SurfaceProbe::default(),
        }
    }

    pub fn probe(&self) -> SurfaceProbe {
        self.probe.clone()
    }
}

impl Default for HeadlessSurfacePort {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FloatingSurfacePort for HeadlessSurfacePort {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn request_surface(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn FloatingSurface>, SurfaceError> {
        if !self.supported {
            return Err(SurfaceError::Unsupported);
        }
        if width == 0 || height == 0 {
            return Err(SurfaceError::Rejected(format!("invalid size {}x{}", width, height)));
        }
        let stop = CancellationToken::new();
        let host_closed = CancellationToken::new();
        *self.probe.inner.tokens.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((stop.clone(), host_closed.clone()));
        Ok(Box::new(HeadlessSurface {
            stop,
            host_closed,
            probe: self.probe.clone(),
        }))
    }
}

/// Observes and drives the most recent headless surface.
#[derive(Clone, Default)]
pub struct SurfaceProbe {
    inner: Arc<ProbeInner>,
}

#[derive(Default)]
struct ProbeInner {
    last: Mutex<Option<MirrorView>>,
    renders: AtomicUsize,
    closes: AtomicUsize,
    tokens: Mutex<Option<(CancellationToken, CancellationToken)>>,
}

impl SurfaceProbe {
    pub fn render_count(&self) -> usize {
        self.inner.renders.load(Ordering::SeqCst)
    }

    pub fn last_render(&self) -> Option<MirrorView> {
        self.inner.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Simulates the user clicking the stop control.
    pub fn press_stop(&self) {
        if let Some((stop, _)) = self.inner.tokens.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            stop.cancel();
        }
    }

    /// Simulates the host closing the surface.
    pub fn close_from_host(&self) {
        if let Some((_, closed)) = self.inner.tokens.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            closed.cancel();
        }
    }
}

struct HeadlessSurface {
    stop: CancellationToken,
    host_closed: CancellationToken,
    probe: SurfaceProbe,
}

impl FloatingSurface for HeadlessSurface {
    fn render(&mut self, view: &MirrorView) {
        info!(
            "[pip] {} {}{}",
            if view.recording { "REC" } else { "---" },
            view.elapsed_label,
            view.instruction
                .as_deref()
                .map(|i| format!(" | {}", i))
                .unwrap_or_default()
        );
        self.probe.inner.renders.fetch_add(1, Ordering::SeqCst);
        *self.probe.inner.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(view.clone());
    }

    fn stop_activated(&self) -> CancellationToken {
        self.stop.clone()
    }

    fn host_closed(&self) -> CancellationToken {
        self.host_closed.clone()
    }

    fn close(&mut self) {
        self.probe.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}
