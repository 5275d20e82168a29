pub mod format;
pub mod headless;
pub mod mirror;

pub use format::format_duration;
pub use headless::{HeadlessSurfacePort, SurfaceProbe};
pub use mirror::{FloatingSurface, FloatingSurfacePort, MirrorContent, MirrorView, PipMirror};
