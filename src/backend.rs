use crate::config::BackendConfig;
use crate::error::{PpecamError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::multipart::{Form, Part};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One violation entry within a report.
#[derive(Debug, Clone)]
pub struct ViolationDetail {
    pub violation_code: String,
    pub confidence_score: Option<f32>,
    pub additional_info: Option<String>,
}

impl ViolationDetail {
    pub fn new<S: Into<String>>(violation_code: S) -> Self {
        Self {
            violation_code: violation_code.into(),
            confidence_score: None,
            additional_info: None,
        }
    }
}

/// HTTP client for the violation-reporting backend.
pub struct BackendClient {
    client: reqwest::Client,
    api_url: String,
    camera_code: String,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if !config.api_key.is_empty() {
            headers.insert(
                "X-API-Key",
                HeaderValue::from_str(&config.api_key)
                    .map_err(|e| PpecamError::backend_config(format!("invalid API key: {}", e)))?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            camera_code: config.camera_code.clone(),
        })
    }

    /// Submit a violation report as multipart form data.
    ///
    /// Returns the backend's JSON body on a 2xx response; a non-2xx
    /// response propagates the status and body for logging.
    pub async fn submit_violation(
        &self,
        image_path: &Path,
        details: &[ViolationDetail],
        notes: Option<&str>,
    ) -> Result<serde_json::Value> {
        let image = tokio::fs::read(image_path).await?;
        let file_name = image_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "violation.jpg".to_string());

        let mut form = Form::new()
            .part(
                "image",
                Part::bytes(image).file_name(file_name).mime_str("image/jpeg")?,
            )
            .text("camera_code", self.camera_code.clone());

        if let Some(notes) = notes {
            form = form.text("notes", notes.to_string());
        }

        for (idx, detail) in details.iter().enumerate() {
            form = form.text(
                format!("violation_details[{}][violation_code]", idx),
                detail.violation_code.clone(),
            );
            if let Some(score) = detail.confidence_score {
                form = form.text(
                    format!("violation_details[{}][confidence_score]", idx),
                    score.to_string(),
                );
            }
            if let Some(info) = &detail.additional_info {
                form = form.text(
                    format!("violation_details[{}][additional_info]", idx),
                    info.clone(),
                );
            }
        }

        let response = self
            .client
            .post(format!("{}/api/violations", self.api_url))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PpecamError::BackendStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response.json().await?;
        info!(
            id = %body.pointer("/data/id").cloned().unwrap_or_default(),
            "violation submitted"
        );
        Ok(body)
    }

    /// Fetch the violation types the backend knows about.
    pub async fn violation_types(&self) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}/api/violation-types", self.api_url))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PpecamError::BackendStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    /// Check whether the backend is reachable.
    pub async fn health_check(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.api_url))
            .send()
            .await
        {
            Ok(response) => {
                debug!(status = %response.status(), "backend health check");
                response.status().is_success()
            }
            Err(e) => {
                warn!("backend health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PpecamConfig;

    #[test]
    fn test_client_normalizes_base_url() {
        let mut config = PpecamConfig::default().backend;
        config.api_url = "http://localhost:8000/".to_string();

        let client = BackendClient::new(&config).unwrap();
        assert_eq!(client.api_url, "http://localhost:8000");
    }

    #[test]
    fn test_invalid_api_key_rejected() {
        let mut config = PpecamConfig::default().backend;
        config.api_key = "bad\nkey".to_string();

        assert!(BackendClient::new(&config).is_err());
    }

    #[test]
    fn test_detail_defaults() {
        let detail = ViolationDetail::new("NO_MASK");
        assert_eq!(detail.violation_code, "NO_MASK");
        assert!(detail.confidence_score.is_none());
        assert!(detail.additional_info.is_none());
    }
}
