//! Headless-render bridge.
//!
//! The browser itself is an external collaborator; this module only defines
//! the narrow seam the pipeline needs and an HTTP implementation that talks
//! to a rendering sidecar. Render failures are never fatal: a check falls
//! back to whatever the static tier produced.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub html: String,
    pub final_url: String,
}

#[async_trait]
pub trait RenderedFetcher: Send + Sync {
    /// Fetch a fully rendered page. `Ok(None)` means the renderer is
    /// unavailable or declined; the caller continues without it.
    async fn fetch_rendered(&self, url: &str, timeout: Duration) -> Result<Option<RenderedPage>>;
}

/// Renderer used when no sidecar is configured.
pub struct NoRenderer;

#[async_trait]
impl RenderedFetcher for NoRenderer {
    async fn fetch_rendered(&self, _url: &str, _timeout: Duration) -> Result<Option<RenderedPage>> {
        Ok(None)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderRequest<'a> {
    url: &'a str,
    goto_timeout_ms: u64,
    // Network-idle settling is best effort; the sidecar swallows its timeout.
    network_idle_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderResponse {
    html: String,
    #[serde(default)]
    final_url: Option<String>,
}

/// HTTP bridge to a rendering sidecar (headless Chromium behind a small API).
pub struct HttpRenderService {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpRenderService {
    pub fn new(endpoint: String) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("Failed to create render HTTP client");
        Self { http, endpoint }
    }
}

#[async_trait]
impl RenderedFetcher for HttpRenderService {
    async fn fetch_rendered(&self, url: &str, timeout: Duration) -> Result<Option<RenderedPage>> {
        let request = RenderRequest {
            url,
            goto_timeout_ms: timeout.as_millis() as u64,
            network_idle_timeout_ms: (timeout / 2).as_millis() as u64,
        };

        // The render call itself gets headroom beyond the page's goto timeout.
        let response = match self
            .http
            .post(&self.endpoint)
            .timeout(timeout + Duration::from_secs(5))
            .json(&request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("render sidecar unreachable: {}", e);
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            tracing::debug!("render sidecar returned {}", response.status());
            return Ok(None);
        }

        let parsed: RenderResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("render sidecar sent malformed response: {}", e);
                return Ok(None);
            }
        };

        Ok(Some(RenderedPage {
            final_url: parsed.final_url.unwrap_or_else(|| url.to_string()),
            html: parsed.html,
        }))
    }
}
