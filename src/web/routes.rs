//! Router construction and request handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::{Router, extract::State, routing::get};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer};

use crate::state::AppState;
use crate::web::middleware::rate_limit::{RateLimitLayer, RateLimitState};

/// Creates the web server router.
pub fn create_router(app_state: AppState) -> Router {
    let rate_limit = Arc::new(RateLimitState::new());

    Router::new()
        .route("/", get(index))
        .route("/offsets", get(offsets))
        .route("/health", get(health))
        .with_state(app_state)
        .layer((
            CompressionLayer::new()
                .zstd(true)
                .br(true)
                .gzip(true)
                .quality(tower_http::CompressionLevel::Fastest),
            TimeoutLayer::new(Duration::from_secs(30)),
            // Innermost so the limiter sees the router's plain response body.
            RateLimitLayer::new(rate_limit),
        ))
}

/// `GET /` -- endpoint listing plus current cache diagnostics.
async fn index(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "endpoints": {
            "offsets": "/offsets",
            "health": "/health",
        },
        "cache": state.cache.info().await,
    }))
}

/// `GET /offsets` -- the merged payload, served from cache.
///
/// A failed refresh with a cached payload still returns 200 with
/// `stale: true`; only a cold cache whose first refresh failed is a 500.
async fn offsets(State(state): State<AppState>) -> Response {
    match state.cache.get().await {
        Ok(payload) => Json(payload).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "ok": false,
                "timestamp": Utc::now(),
                "error": err.to_string(),
                "cache": state.cache.info().await,
            })),
        )
            .into_response(),
    }
}

/// `GET /health` -- liveness plus cache diagnostics.
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "cache": state.cache.info().await,
    }))
}
