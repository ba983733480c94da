mod backend;
mod backends;
mod result;
mod tracker;

use anyhow::Result;
use std::path::Path;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{BoundingBox, ClassCounts, Detection, DetectionSet, ObjectClass};
pub use tracker::{IouTracker, TrackerConfig, TrackingBackend};

/// Model input size used for ONNX backends.
pub const MODEL_INPUT_SIZE: u32 = 640;

/// Build the detector named by `model`.
///
/// - `stub`: `StubBackend`
/// - `*.onnx`: `TractBackend` (requires the `backend-tract` feature)
///
/// Backends that do not track on their own are wrapped in a `TrackingBackend`.
pub fn build_backend(model: &str, confidence: f32) -> Result<Box<dyn DetectorBackend>> {
    let backend: Box<dyn DetectorBackend> = if model == "stub" {
        Box::new(StubBackend::new())
    } else if Path::new(model)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"))
    {
        #[cfg(feature = "backend-tract")]
        {
            Box::new(
                TractBackend::new(model, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE)?
                    .with_threshold(confidence),
            )
        }
        #[cfg(not(feature = "backend-tract"))]
        {
            let _ = confidence;
            anyhow::bail!("ONNX model {} requires the backend-tract feature", model)
        }
    } else {
        anyhow::bail!("unsupported model '{}'; expected 'stub' or an .onnx file", model)
    };

    if backend.tracks_objects() {
        Ok(backend)
    } else {
        Ok(Box::new(TrackingBackend::new(
            backend,
            TrackerConfig::default(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_model_is_wrapped_with_tracker() -> Result<()> {
        let backend = build_backend("stub", 0.5)?;
        assert_eq!(backend.name(), "stub");
        assert!(backend.tracks_objects());
        Ok(())
    }

    #[test]
    fn unknown_model_is_rejected() {
        assert!(build_backend("weights.bin", 0.5).is_err());
    }
}
