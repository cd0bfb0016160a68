use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{BackgroundRemover, ProviderError};

const API_KEY_HEADER: &str = "X-Api-Key";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Metered remove.bg style HTTP API. Every successful call costs one unit of
/// the monthly allowance.
pub struct RemoteRemover {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RemoteRemover {
    pub fn new(base_url: String, api_key: Option<String>, timeout_secs: u64) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(10)
            .build()?;

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "Invalid remote API URL: must start with http:// or https://"
            ));
        }

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Probes the account endpoint. Never consumes quota.
    pub async fn check_health(&self) -> bool {
        let Some(api_key) = self.api_key.as_deref() else {
            return false;
        };

        let url = format!("{}/account", self.base_url);
        match self
            .http_client
            .get(&url)
            .header(API_KEY_HEADER, api_key)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status() == StatusCode::OK,
            Err(err) => {
                warn!(error = %err, "remote background removal health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl BackgroundRemover for RemoteRemover {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn process(&self, image: Bytes) -> Result<Bytes, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ProviderError::auth(
                "Remote API key not configured. Please set REMOVE_BG_API_KEY environment variable.",
            )
        })?;

        let start = std::time::Instant::now();
        let image_part = Part::bytes(image.to_vec())
            .file_name("image.png")
            .mime_str("image/png")?;
        let form = Form::new()
            .part("image_file", image_part)
            .text("size", "auto")
            .text("format", "png");

        let url = format!("{}/removebg", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .header(API_KEY_HEADER, api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        debug!(status = status.as_u16(), latency = ?start.elapsed(), "remote API responded");

        match status {
            StatusCode::OK => {
                let body = response.bytes().await?;
                if body.is_empty() {
                    return Err(ProviderError::generic("remote API returned an empty image"));
                }
                Ok(body)
            }
            StatusCode::PAYMENT_REQUIRED => Err(ProviderError::quota(
                "Remote API quota exceeded. Please check your subscription.",
            )),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::auth(
                "Remote API key is invalid or expired.",
            )),
            StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::rate_limit(
                "Remote API rate limit exceeded. Please try again later.",
            )),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Err(
                ProviderError::timeout("Background removal request timed out. Please try again."),
            ),
            _ => {
                let error_body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Failed to read error body".to_string());
                Err(ProviderError::generic(format!(
                    "Remote API returned status {}: {}",
                    status.as_u16(),
                    error_body.trim()
                )))
            }
        }
    }
}
