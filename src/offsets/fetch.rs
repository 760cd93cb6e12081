//! Upstream HTTP fetching.
//!
//! One call = one GET with a fixed timeout and identifying User-Agent. No
//! retries here; retry cadence belongs to the cache coordinator's TTL cycle.

use crate::offsets::errors::FetchError;
use crate::offsets::json::decode_json;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("offset-server/", env!("CARGO_PKG_VERSION"));

/// Seam between the cache coordinator and the network, so refresh logic can
/// be exercised with a scripted fetcher in tests.
#[async_trait]
pub trait FetchJson: Send + Sync {
    /// Fetch a URL and decode its body as JSON.
    async fn fetch_json(&self, url: &str) -> Result<Value, FetchError>;
}

/// reqwest-backed fetcher used in production.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchJson for HttpFetcher {
    async fn fetch_json(&self, url: &str) -> Result<Value, FetchError> {
        debug!(url, "fetching upstream document");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::new(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::new(
                url,
                anyhow::anyhow!("unexpected status {status}"),
            ));
        }

        let body = response.text().await.map_err(|e| FetchError::new(url, e))?;
        decode_json(&body).map_err(|e| FetchError::new(url, e))
    }
}
