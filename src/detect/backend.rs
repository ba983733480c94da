use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Object detection capability.
///
/// Backends are treated as opaque: given a frame they return detections in
/// frame pixel coordinates. A backend that already runs its own tracker
/// stamps `track_id` itself and reports `tracks_objects() == true`; any
/// other backend is wrapped in a `TrackingBackend` by `build_backend`.
///
/// `detect` is invoked from the detection thread only, at most once per
/// cycle, with an immutable frame that other stages may be reading too.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// True when detections already carry stable tracking ids.
    fn tracks_objects(&self) -> bool {
        false
    }

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: DetectorBackend + ?Sized> DetectorBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn tracks_objects(&self) -> bool {
        (**self).tracks_objects()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
