use crate::error::Result;
use image::codecs::jpeg::JpegEncoder;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Bytes per pixel for the pipeline's fixed BGR24 format.
pub const BYTES_PER_PIXEL: usize = 3;

/// One decoded image from the video source.
///
/// Frames are owned exclusively by the pipeline stage currently holding them
/// and cloned when handed to the delivery bridge or the violation buffer,
/// since encoding and submission happen on independent timelines.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw pixel data in BGR24 layout (`width * height * 3` bytes)
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Timestamp when the frame was captured
    pub captured_at: SystemTime,
}

impl Frame {
    /// Create a new frame captured now.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            captured_at: SystemTime::now(),
        }
    }

    /// Byte length of one raw BGR24 frame at the given dimensions.
    pub fn frame_size(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    /// Expected byte length for this frame's dimensions.
    pub fn expected_size(&self) -> usize {
        Self::frame_size(self.width, self.height)
    }

    /// Validate the pixel buffer length against the frame dimensions.
    pub fn validate_size(&self) -> bool {
        self.data.len() == self.expected_size()
    }

    /// Get frame age in milliseconds.
    pub fn age_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.captured_at)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// One model-reported object instance within a frame.
///
/// Immutable once produced; the pipeline assumes nothing about ordering
/// beyond "all detections belong to the same frame".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// Numeric class identifier from the model
    pub class_id: u32,
    /// Human-readable class name (e.g. "mask", "no-mask")
    pub class_name: String,
    /// Confidence score in [0, 1]
    pub confidence: f32,
    /// Bounding box as [x1, y1, x2, y2]
    pub bbox: [f32; 4],
}

impl Detection {
    /// Whether this detection denotes a non-compliant state.
    ///
    /// Violation classes are named with a `no-` prefix (e.g. "no-mask").
    pub fn is_violation(&self) -> bool {
        self.class_name.starts_with("no-")
    }
}

/// Encode a raw BGR24 frame as JPEG at the given quality.
///
/// The `image` encoder wants RGB, so channels are swapped before encoding.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    if !frame.validate_size() {
        return Err(crate::error::PpecamError::encoder(format!(
            "frame buffer is {} bytes, expected {} for {}x{}",
            frame.data.len(),
            frame.expected_size(),
            frame.width,
            frame.height
        )));
    }

    let mut rgb = frame.data.clone();
    for pixel in rgb.chunks_exact_mut(BYTES_PER_PIXEL) {
        pixel.swap(0, 2);
    }

    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode(&rgb, frame.width, frame.height, image::ColorType::Rgb8)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![0u8; Frame::frame_size(width, height)], width, height)
    }

    #[test]
    fn test_frame_size_validation() {
        let valid = test_frame(640, 480);
        assert!(valid.validate_size());

        let invalid = Frame::new(vec![0u8; 100], 640, 480);
        assert!(!invalid.validate_size());
    }

    #[test]
    fn test_detection_violation_classes() {
        let compliant = Detection {
            class_id: 2,
            class_name: "mask".to_string(),
            confidence: 0.9,
            bbox: [0.0, 0.0, 10.0, 10.0],
        };
        assert!(!compliant.is_violation());

        let violation = Detection {
            class_id: 5,
            class_name: "no-mask".to_string(),
            confidence: 0.8,
            bbox: [0.0, 0.0, 10.0, 10.0],
        };
        assert!(violation.is_violation());
    }

    #[test]
    fn test_encode_jpeg_produces_valid_markers() {
        let frame = test_frame(16, 8);
        let jpeg = encode_jpeg(&frame, 85).unwrap();

        // SOI marker at the start, EOI at the end
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_encode_jpeg_rejects_short_buffer() {
        let frame = Frame::new(vec![0u8; 10], 16, 8);
        assert!(encode_jpeg(&frame, 85).is_err());
    }
}
