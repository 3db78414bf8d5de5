use thiserror::Error;

#[derive(Error, Debug)]
pub enum PpecamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source error: {details}")]
    Source { details: String },

    #[error("Encoder error: {details}")]
    Encoder { details: String },

    #[error("Detector error: {details}")]
    Detect { details: String },

    #[error("JPEG encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Backend rejected request ({status}): {body}")]
    BackendStatus { status: u16, body: String },

    #[error("Backend request failed: {0}")]
    BackendTransport(#[from] reqwest::Error),

    #[error("Backend configuration error: {details}")]
    BackendConfig { details: String },

    #[error("Server error: {details}")]
    Server { details: String },
}

impl PpecamError {
    pub fn source<S: Into<String>>(details: S) -> Self {
        Self::Source {
            details: details.into(),
        }
    }

    pub fn encoder<S: Into<String>>(details: S) -> Self {
        Self::Encoder {
            details: details.into(),
        }
    }

    pub fn detect<S: Into<String>>(details: S) -> Self {
        Self::Detect {
            details: details.into(),
        }
    }

    pub fn backend_config<S: Into<String>>(details: S) -> Self {
        Self::BackendConfig {
            details: details.into(),
        }
    }

    pub fn server<S: Into<String>>(details: S) -> Self {
        Self::Server {
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PpecamError>;
