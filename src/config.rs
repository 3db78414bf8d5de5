use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PpecamConfig {
    pub source: SourceConfig,
    pub server: ServerConfig,
    pub output: OutputConfig,
    pub detector: DetectorConfig,
    pub backend: BackendConfig,
    pub ffmpeg: FfmpegConfig,
}

/// Video source kind, selected once at startup.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Url,
    Webcam,
    File,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Url => write!(f, "url"),
            SourceKind::Webcam => write!(f, "webcam"),
            SourceKind::File => write!(f, "file"),
        }
    }
}

/// Frame delivery mode.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Continuous multipart JPEG stream pushed to connected clients
    Push,
    /// Rolling segmented playlist written by an external encoder
    Segmented,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Push => write!(f, "push"),
            OutputMode::Segmented => write!(f, "segmented"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    /// Source kind: url, webcam, or file
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,

    /// Stream URL (kind = url)
    #[serde(default)]
    pub url: String,

    /// Local video file path (kind = file)
    #[serde(default)]
    pub file_path: String,

    /// Capture device index (kind = webcam, e.g. 0 for /dev/video0)
    #[serde(default = "default_webcam_index")]
    pub webcam_index: u32,

    /// Requested webcam resolution (width, height)
    #[serde(default = "default_webcam_resolution")]
    pub webcam_resolution: (u32, u32),
}

impl SourceConfig {
    /// The locator handed to the probe tool and the decoder process.
    pub fn locator(&self) -> &str {
        match self.kind {
            SourceKind::Url => &self.url,
            SourceKind::File => &self.file_path,
            SourceKind::Webcam => "",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// IP address to bind to
    #[serde(default = "default_server_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    /// Delivery mode: push or segmented
    #[serde(default = "default_output_mode")]
    pub mode: OutputMode,

    /// Directory holding the playlist and segment files (segmented mode)
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Playlist file name within the output directory
    #[serde(default = "default_playlist_name")]
    pub playlist_name: String,

    /// Target segment duration in seconds
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,

    /// Number of segments kept in the playlist
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,

    /// Segments the encoder keeps beyond the playlist before deleting
    #[serde(default = "default_delete_threshold")]
    pub delete_threshold: u32,

    /// JPEG quality for push-mode frames (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Multipart boundary token for push mode
    #[serde(default = "default_boundary")]
    pub boundary: String,

    /// Per-client broadcast queue depth for push mode
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Bounded wait for handing a frame to the delivery bridge, in milliseconds
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
}

impl OutputConfig {
    /// Full path of the playlist file.
    pub fn playlist_path(&self) -> std::path::PathBuf {
        Path::new(&self.output_dir).join(&self.playlist_name)
    }

    /// Segment count the retention manager preserves: everything the
    /// encoder may still legitimately reference.
    pub fn retention_keep_count(&self) -> usize {
        (self.playlist_size + self.delete_threshold) as usize
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectorConfig {
    /// Path to the detection model file
    #[serde(default = "default_model_path")]
    pub model_path: String,

    /// Inference device (cpu, cuda, mps, ...)
    #[serde(default = "default_detector_device")]
    pub device: String,

    /// Class-id filter applied by the model
    #[serde(default = "default_detector_classes")]
    pub classes: Vec<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackendConfig {
    /// Backend API base URL
    #[serde(default = "default_backend_url")]
    pub api_url: String,

    /// API key sent as X-API-Key
    #[serde(default)]
    pub api_key: String,

    /// Camera identifier reported with each violation
    #[serde(default = "default_camera_code")]
    pub camera_code: String,

    /// Minimum interval between accepted submissions of the same
    /// violation type, in seconds (valid range 3-10)
    #[serde(default = "default_violation_delay")]
    pub violation_delay_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FfmpegConfig {
    /// Protocol whitelist passed to the decoder and probe tools
    #[serde(default = "default_protocol_whitelist")]
    pub protocol_whitelist: String,

    /// Log level passed to the decoder/encoder processes
    #[serde(default = "default_ffmpeg_loglevel")]
    pub loglevel: String,

    /// Probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
}

impl PpecamConfig {
    /// Load configuration from default sources (file + environment variables).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("ppecam.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("source.kind", "url")?
            .set_default("source.url", "")?
            .set_default("source.file_path", "")?
            .set_default("source.webcam_index", default_webcam_index())?
            .set_default(
                "source.webcam_resolution",
                vec![
                    default_webcam_resolution().0,
                    default_webcam_resolution().1,
                ],
            )?
            .set_default("server.ip", default_server_ip())?
            .set_default("server.port", default_server_port())?
            .set_default("output.mode", "push")?
            .set_default("output.output_dir", default_output_dir())?
            .set_default("output.playlist_name", default_playlist_name())?
            .set_default("output.segment_seconds", default_segment_seconds())?
            .set_default("output.playlist_size", default_playlist_size())?
            .set_default("output.delete_threshold", default_delete_threshold())?
            .set_default("output.jpeg_quality", default_jpeg_quality() as i64)?
            .set_default("output.boundary", default_boundary())?
            .set_default("output.max_queue_depth", default_max_queue_depth() as i64)?
            .set_default(
                "output.enqueue_timeout_ms",
                default_enqueue_timeout_ms() as i64,
            )?
            .set_default("detector.model_path", default_model_path())?
            .set_default("detector.device", default_detector_device())?
            .set_default(
                "detector.classes",
                default_detector_classes()
                    .into_iter()
                    .map(|c| c as i64)
                    .collect::<Vec<_>>(),
            )?
            .set_default("backend.api_url", default_backend_url())?
            .set_default("backend.api_key", "")?
            .set_default("backend.camera_code", default_camera_code())?
            .set_default(
                "backend.violation_delay_seconds",
                default_violation_delay() as i64,
            )?
            .set_default("ffmpeg.protocol_whitelist", default_protocol_whitelist())?
            .set_default("ffmpeg.loglevel", default_ffmpeg_loglevel())?
            .set_default(
                "ffmpeg.probe_timeout_seconds",
                default_probe_timeout() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with PPECAM_ prefix
            .add_source(Environment::with_prefix("PPECAM").separator("_"))
            .build()?;

        let config: PpecamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.source.kind {
            SourceKind::Url => {
                if self.source.url.is_empty() {
                    return Err(ConfigError::Message(
                        "source.url must be set when source.kind is \"url\"".to_string(),
                    ));
                }
            }
            SourceKind::File => {
                if self.source.file_path.is_empty() {
                    return Err(ConfigError::Message(
                        "source.file_path must be set when source.kind is \"file\"".to_string(),
                    ));
                }
            }
            SourceKind::Webcam => {
                if self.source.webcam_resolution.0 == 0 || self.source.webcam_resolution.1 == 0 {
                    return Err(ConfigError::Message(
                        "Webcam resolution must be greater than 0".to_string(),
                    ));
                }
            }
        }

        if self.server.port == 0 {
            return Err(ConfigError::Message(
                "Server port must be greater than 0".to_string(),
            ));
        }

        if self.output.jpeg_quality == 0 || self.output.jpeg_quality > 100 {
            return Err(ConfigError::Message(
                "JPEG quality must be in range 1-100".to_string(),
            ));
        }

        if self.output.boundary.is_empty() {
            return Err(ConfigError::Message(
                "Multipart boundary must not be empty".to_string(),
            ));
        }

        if self.output.max_queue_depth == 0 {
            return Err(ConfigError::Message(
                "Broadcast queue depth must be greater than 0".to_string(),
            ));
        }

        if self.output.segment_seconds == 0 {
            return Err(ConfigError::Message(
                "Segment duration must be greater than 0".to_string(),
            ));
        }

        if self.output.playlist_size == 0 {
            return Err(ConfigError::Message(
                "Playlist size must be greater than 0".to_string(),
            ));
        }

        if self.backend.camera_code.is_empty() {
            return Err(ConfigError::Message(
                "Camera code must not be empty".to_string(),
            ));
        }

        if self.backend.api_url.is_empty() {
            return Err(ConfigError::Message(
                "Backend API URL must not be empty".to_string(),
            ));
        }

        if !(3..=10).contains(&self.backend.violation_delay_seconds) {
            return Err(ConfigError::Message(
                "Violation delay must be between 3 and 10 seconds".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for PpecamConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                kind: default_source_kind(),
                url: String::new(),
                file_path: String::new(),
                webcam_index: default_webcam_index(),
                webcam_resolution: default_webcam_resolution(),
            },
            server: ServerConfig {
                ip: default_server_ip(),
                port: default_server_port(),
            },
            output: OutputConfig {
                mode: default_output_mode(),
                output_dir: default_output_dir(),
                playlist_name: default_playlist_name(),
                segment_seconds: default_segment_seconds(),
                playlist_size: default_playlist_size(),
                delete_threshold: default_delete_threshold(),
                jpeg_quality: default_jpeg_quality(),
                boundary: default_boundary(),
                max_queue_depth: default_max_queue_depth(),
                enqueue_timeout_ms: default_enqueue_timeout_ms(),
            },
            detector: DetectorConfig {
                model_path: default_model_path(),
                device: default_detector_device(),
                classes: default_detector_classes(),
            },
            backend: BackendConfig {
                api_url: default_backend_url(),
                api_key: String::new(),
                camera_code: default_camera_code(),
                violation_delay_seconds: default_violation_delay(),
            },
            ffmpeg: FfmpegConfig {
                protocol_whitelist: default_protocol_whitelist(),
                loglevel: default_ffmpeg_loglevel(),
                probe_timeout_seconds: default_probe_timeout(),
            },
        }
    }
}

// Default value functions
fn default_source_kind() -> SourceKind {
    SourceKind::Url
}
fn default_webcam_index() -> u32 {
    0
}
fn default_webcam_resolution() -> (u32, u32) {
    (640, 480)
}

fn default_server_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    8081
}

fn default_output_mode() -> OutputMode {
    OutputMode::Push
}
fn default_output_dir() -> String {
    "output/hls".to_string()
}
fn default_playlist_name() -> String {
    "stream.m3u8".to_string()
}
fn default_segment_seconds() -> u32 {
    10
}
fn default_playlist_size() -> u32 {
    10
}
fn default_delete_threshold() -> u32 {
    1
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_boundary() -> String {
    "frame".to_string()
}
fn default_max_queue_depth() -> usize {
    1
}
fn default_enqueue_timeout_ms() -> u64 {
    100
}

fn default_model_path() -> String {
    "models/best.pt".to_string()
}
fn default_detector_device() -> String {
    "cpu".to_string()
}
fn default_detector_classes() -> Vec<u32> {
    // apron, hairnet, mask, no-apron, no-hairnet, no-mask
    vec![0, 1, 2, 3, 4, 5]
}

fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_camera_code() -> String {
    "CAM001".to_string()
}
fn default_violation_delay() -> u64 {
    5
}

fn default_protocol_whitelist() -> String {
    "file,http,https,tcp,tls,crypto".to_string()
}
fn default_ffmpeg_loglevel() -> String {
    "error".to_string()
}
fn default_probe_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_config() -> PpecamConfig {
        let mut config = PpecamConfig::default();
        config.source.url = "https://example.com/stream.m3u8".to_string();
        config
    }

    #[test]
    fn test_default_config_validates() {
        let config = url_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_url_kind_requires_url() {
        let config = PpecamConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_kind_requires_path() {
        let mut config = PpecamConfig::default();
        config.source.kind = SourceKind::File;
        assert!(config.validate().is_err());

        config.source.file_path = "assets/demo.mp4".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_violation_delay_range() {
        let mut config = url_config();

        config.backend.violation_delay_seconds = 2;
        assert!(config.validate().is_err());

        config.backend.violation_delay_seconds = 11;
        assert!(config.validate().is_err());

        for delay in 3..=10 {
            config.backend.violation_delay_seconds = delay;
            assert!(config.validate().is_ok(), "delay {} should be valid", delay);
        }
    }

    #[test]
    fn test_jpeg_quality_range() {
        let mut config = url_config();

        config.output.jpeg_quality = 0;
        assert!(config.validate().is_err());

        config.output.jpeg_quality = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retention_keep_count() {
        let config = PpecamConfig::default();
        assert_eq!(config.output.retention_keep_count(), 11);
    }

    #[test]
    fn test_playlist_path() {
        let config = PpecamConfig::default();
        assert_eq!(
            config.output.playlist_path(),
            Path::new("output/hls").join("stream.m3u8")
        );
    }
}
