//! Upstream fetcher.
//!
//! One synchronous-looking GET against the fixed origin per cache
//! miss. Every failure mode (transport, non-200, truncated body)
//! collapses to [`FetchError`]; the orchestrator treats them all as
//! service-unavailable and logs the distinguishing reason. No retries
//! happen here.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HOST};
use thiserror::Error;

use crate::config::{UpstreamProtocol, UpstreamSettings};

/// Transient origin response; always passed through the envelope
/// codec before anything persists it.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub content_type: String,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to upstream failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("unexpected upstream status code {0}")]
    Status(u16),
    #[error("failed reading upstream response body: {0}")]
    Body(#[source] reqwest::Error),
}

/// Seam for the orchestrator; tests substitute a scripted origin.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        host_for_request: &str,
        path_and_query: &str,
    ) -> Result<UpstreamResponse, FetchError>;
}

/// HTTP client bound to the configured origin.
pub struct UpstreamFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamFetcher {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(settings.max_idle_connections)
            .build()?;
        let scheme = match settings.protocol {
            UpstreamProtocol::Http => "http",
            UpstreamProtocol::Https => "https",
        };
        Ok(Self {
            client,
            base_url: format!("{scheme}://{}", settings.host),
        })
    }
}

#[async_trait]
impl Fetch for UpstreamFetcher {
    async fn fetch(
        &self,
        host_for_request: &str,
        path_and_query: &str,
    ) -> Result<UpstreamResponse, FetchError> {
        let url = format!("{}{path_and_query}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(HOST, host_for_request)
            .send()
            .await
            .map_err(FetchError::Transport)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await.map_err(FetchError::Body)?;

        Ok(UpstreamResponse { content_type, body })
    }
}
