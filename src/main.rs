use anyhow::Context;
use clap::Parser;
use offset_server::cli::Args;
use offset_server::config;
use offset_server::logging::setup_logging;
use offset_server::offsets::cache::{OffsetCache, UpstreamUrls};
use offset_server::offsets::fetch::HttpFetcher;
use offset_server::offsets::merge::RequiredKeys;
use offset_server::state::AppState;
use offset_server::web::create_router;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config and setup logging before anything else so startup logs are never silently dropped
    let config = config::load()?;
    setup_logging(&config, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting offset server"
    );

    let fetcher = HttpFetcher::new(Duration::from_secs(config.fetch_timeout_seconds))
        .context("Failed to build HTTP fetcher")?;

    let cache = OffsetCache::new(
        Arc::new(fetcher),
        UpstreamUrls {
            offsets: config.offsets_url.clone(),
            client_dll: config.client_dll_url.clone(),
        },
        RequiredKeys::default(),
        Duration::from_secs(config.cache_ttl_seconds),
    );

    let router = create_router(AppState::new(cache));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;

    info!(
        port = config.port,
        ttl_seconds = config.cache_ttl_seconds,
        "offset server listening"
    );

    axum::serve(listener, router)
        .await
        .context("HTTP server error")
}
