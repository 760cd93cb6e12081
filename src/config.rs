//! Environment-driven configuration.
//!
//! Everything is read once at startup via figment's `Env` provider; fields
//! fall back to serde defaults so a bare environment still boots a working
//! server against the public cs2-dumper output files.

use anyhow::Context;
use figment::{Figment, providers::Env};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port the HTTP server binds to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upstream URL for the flat per-module offsets document.
    #[serde(default = "default_offsets_url")]
    pub offsets_url: String,

    /// Upstream URL for the nested client_dll class/field document.
    #[serde(default = "default_client_dll_url")]
    pub client_dll_url: String,

    /// How long a merged snapshot stays fresh before a refresh is triggered.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// Per-request timeout for each upstream fetch.
    #[serde(default = "default_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,

    /// Base log level when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    1337
}

fn default_offsets_url() -> String {
    "https://raw.githubusercontent.com/a2x/cs2-dumper/refs/heads/main/output/offsets.json".into()
}

fn default_client_dll_url() -> String {
    "https://raw.githubusercontent.com/a2x/cs2-dumper/refs/heads/main/output/client_dll.json".into()
}

fn default_cache_ttl_seconds() -> u64 {
    5 * 60
}

fn default_fetch_timeout_seconds() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".into()
}

/// Load configuration from the process environment.
pub fn load() -> anyhow::Result<Config> {
    Figment::new()
        .merge(Env::raw())
        .extract()
        .context("Failed to load config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: Config = Figment::new()
            .merge(Env::raw().only(&["__OFFSET_SERVER_NO_SUCH_VAR"]))
            .extract()
            .unwrap();
        assert_eq!(config.port, 1337);
        assert_eq!(config.cache_ttl_seconds, 300);
        assert_eq!(config.fetch_timeout_seconds, 15);
        assert!(config.offsets_url.contains("offsets.json"));
        assert!(config.client_dll_url.contains("client_dll.json"));
    }
}
