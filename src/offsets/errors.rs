//! Error types for the offset pipeline.

/// A single upstream fetch failed: network error, timeout, non-2xx status,
/// or a body that did not decode as JSON.
#[derive(Debug, thiserror::Error)]
#[error("fetch failed for {url}: {source}")]
pub struct FetchError {
    pub url: String,
    #[source]
    pub source: anyhow::Error,
}

impl FetchError {
    pub fn new(url: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self {
            url: url.into(),
            source: source.into(),
        }
    }
}

/// A refresh failed and there is no previously cached payload to fall back
/// to. The only error surfaced to HTTP callers as a hard failure.
///
/// Clone so every caller joined on a single-flight refresh receives it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CacheError {
    pub message: String,
}

impl CacheError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
