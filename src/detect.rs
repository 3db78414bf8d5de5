use crate::config::DetectorConfig;
use crate::error::Result;
use crate::frame::{Detection, Frame};
use tracing::info;

/// Object-detection stage.
///
/// The call is synchronous and blocking; it dominates per-frame latency.
/// Implementations return the annotated frame plus all detections for it,
/// in no particular order.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<(Frame, Vec<Detection>)>;
}

/// Passthrough stage that emits the input frame unchanged with no
/// detections. Stands in when no inference backend is wired up, keeping the
/// frame path intact.
pub struct PassthroughDetector;

impl Detector for PassthroughDetector {
    fn detect(&mut self, frame: &Frame) -> Result<(Frame, Vec<Detection>)> {
        Ok((frame.clone(), Vec::new()))
    }
}

/// Build the detection stage for the configured model.
///
/// Model inference runs behind the `Detector` seam; deployments plug their
/// backend in here.
pub fn from_config(config: &DetectorConfig) -> Result<Box<dyn Detector>> {
    info!(
        model = %config.model_path,
        device = %config.device,
        classes = ?config.classes,
        "detection stage ready"
    );
    Ok(Box::new(PassthroughDetector))
}

/// Map a detected class name to its backend violation code.
///
/// Known classes have fixed codes; anything else is normalized
/// (uppercase, `-` replaced with `_`).
pub fn violation_code_for(class_name: &str) -> String {
    match class_name {
        "no-apron" => "NO_APRON".to_string(),
        "no-hairnet" => "NO_HAIRNET".to_string(),
        "no-mask" => "NO_MASK".to_string(),
        other => other.to_uppercase().replace('-', "_"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_code_mapping() {
        assert_eq!(violation_code_for("no-apron"), "NO_APRON");
        assert_eq!(violation_code_for("no-hairnet"), "NO_HAIRNET");
        assert_eq!(violation_code_for("no-mask"), "NO_MASK");
    }

    #[test]
    fn test_violation_code_fallback_normalizes() {
        assert_eq!(violation_code_for("no-gloves"), "NO_GLOVES");
        assert_eq!(violation_code_for("no-safety-vest"), "NO_SAFETY_VEST");
    }

    #[test]
    fn test_passthrough_detector_keeps_frame() {
        let frame = Frame::new(vec![7u8; Frame::frame_size(4, 2)], 4, 2);
        let mut detector = PassthroughDetector;

        let (annotated, detections) = detector.detect(&frame).unwrap();
        assert_eq!(annotated.data, frame.data);
        assert!(detections.is_empty());
    }
}
