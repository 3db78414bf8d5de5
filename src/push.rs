use crate::frame::{self, Frame};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

/// Encodes frames as boundary-delimited multipart records for continuous
/// push delivery.
///
/// Each record is laid out as:
///
/// ```text
/// --<boundary>\r\n
/// Content-Type: image/jpeg\r\n
/// Content-Length: <n>\r\n
/// \r\n
/// <jpeg payload>\r\n
/// ```
///
/// Encoding is a pure per-call transform with no side effects beyond the
/// produced bytes.
pub struct MultipartEncoder {
    boundary: String,
    jpeg_quality: u8,
}

impl MultipartEncoder {
    pub fn new(boundary: &str, jpeg_quality: u8) -> Self {
        Self {
            boundary: boundary.to_string(),
            jpeg_quality,
        }
    }

    /// The content type announced to stream clients.
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    /// Encode one frame as a multipart record.
    ///
    /// Returns `None` when JPEG encoding fails; the caller skips delivery
    /// for that frame.
    pub fn encode_frame(&self, frame: &Frame) -> Option<Bytes> {
        let jpeg = match frame::encode_jpeg(frame, self.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!("JPEG encoding failed, skipping frame: {}", e);
                return None;
            }
        };

        let header = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            self.boundary,
            jpeg.len()
        );

        let mut record = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
        record.put_slice(header.as_bytes());
        record.put_slice(&jpeg);
        record.put_slice(b"\r\n");
        Some(record.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame() -> Frame {
        Frame::new(vec![128u8; Frame::frame_size(16, 8)], 16, 8)
    }

    /// Split a record into (headers, payload), stripping the trailing
    /// delimiter.
    fn split_record(record: &[u8]) -> (String, Vec<u8>) {
        let sep = b"\r\n\r\n";
        let pos = record
            .windows(sep.len())
            .position(|w| w == sep)
            .expect("record has a header/payload separator");
        let headers = String::from_utf8(record[..pos].to_vec()).unwrap();
        let payload = record[pos + sep.len()..record.len() - 2].to_vec();
        (headers, payload)
    }

    #[test]
    fn test_record_layout() {
        let encoder = MultipartEncoder::new("frame", 85);
        let record = encoder.encode_frame(&test_frame()).unwrap();

        let (headers, payload) = split_record(&record);
        assert!(headers.starts_with("--frame\r\n"));
        assert!(headers.contains("Content-Type: image/jpeg"));
        assert!(record.ends_with(b"\r\n"));
        // Payload is a JPEG
        assert_eq!(&payload[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_declared_length_matches_payload() {
        let encoder = MultipartEncoder::new("frame", 85);
        let record = encoder.encode_frame(&test_frame()).unwrap();

        let (headers, payload) = split_record(&record);
        let declared: usize = headers
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .expect("record declares a content length")
            .parse()
            .unwrap();
        assert_eq!(declared, payload.len());
    }

    #[test]
    fn test_encode_failure_returns_none() {
        let encoder = MultipartEncoder::new("frame", 85);
        // Buffer length does not match the declared dimensions
        let bad = Frame::new(vec![0u8; 10], 16, 8);
        assert!(encoder.encode_frame(&bad).is_none());
    }

    #[test]
    fn test_content_type_carries_boundary() {
        let encoder = MultipartEncoder::new("ppecam", 85);
        assert_eq!(
            encoder.content_type(),
            "multipart/x-mixed-replace; boundary=ppecam"
        );
    }
}
