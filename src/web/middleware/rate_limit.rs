//! Inbound HTTP rate limiting with per-IP token buckets.
//!
//! Two limiters evaluated in order (first rejection wins):
//!
//! 1. **Global per-IP** -- applies to every route (120/min)
//! 2. **Offsets per-IP** -- stricter budget on `/offsets` (30/min)
//!
//! Rejections are JSON bodies with `ok:false` so clients parsing the offset
//! payload never see a non-JSON error. Requests whose client IP cannot be
//! determined are allowed through.

use crate::web::middleware::header_str;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter, clock::Clock};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};
use tracing::warn;

const GLOBAL_PER_MINUTE: u32 = 120;
const OFFSETS_PER_MINUTE: u32 = 30;

const GLOBAL_MESSAGE: &str = "Too many requests. Please try again soon.";
const OFFSETS_MESSAGE: &str = "Rate limit exceeded for /offsets.";

/// Holds the keyed limiters for both windows.
pub struct RateLimitState {
    global: DefaultKeyedRateLimiter<IpAddr>,
    offsets: DefaultKeyedRateLimiter<IpAddr>,
}

/// Quota helper: `count` requests per `period` with burst = count.
fn quota(count: u32, period: Duration) -> Quota {
    Quota::with_period(period / count)
        .expect("non-zero period")
        .allow_burst(NonZeroU32::new(count).expect("non-zero count"))
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    pub fn new() -> Self {
        Self {
            global: RateLimiter::keyed(quota(GLOBAL_PER_MINUTE, Duration::from_secs(60))),
            offsets: RateLimiter::keyed(quota(OFFSETS_PER_MINUTE, Duration::from_secs(60))),
        }
    }

    /// Check the applicable limiters for this request. Returns `Ok(())` if
    /// allowed, or `Err((message, retry_after_secs))` on rejection.
    fn check(&self, ip: IpAddr, path: &str) -> Result<(), (&'static str, u64)> {
        if let Err(not_until) = self.global.check_key(&ip) {
            let wait = not_until.wait_time_from(governor::clock::DefaultClock::default().now());
            return Err((GLOBAL_MESSAGE, wait.as_secs().max(1)));
        }
        if path == "/offsets"
            && let Err(not_until) = self.offsets.check_key(&ip)
        {
            let wait = not_until.wait_time_from(governor::clock::DefaultClock::default().now());
            return Err((OFFSETS_MESSAGE, wait.as_secs().max(1)));
        }
        Ok(())
    }
}

pub type SharedRateLimitState = Arc<RateLimitState>;

// -- Tower Layer + Service --

#[derive(Clone)]
pub struct RateLimitLayer {
    state: SharedRateLimitState,
}

impl RateLimitLayer {
    pub fn new(state: SharedRateLimitState) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: SharedRateLimitState,
}

impl<S, ResBody> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response<ResBody>> + Send + Clone + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Debug + Send,
    ResBody: Send + 'static,
    Body: Into<ResBody>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let Some(ip) = extract_ip_from_headers(req.headers()) else {
            // Cannot determine IP -- allow.
            let future = self.inner.call(req);
            return Box::pin(future);
        };

        let path = req.uri().path().to_string();

        match self.state.check(ip, &path) {
            Ok(()) => {
                let future = self.inner.call(req);
                Box::pin(future)
            }
            Err((message, retry_after)) => {
                warn!(
                    client_ip = %ip,
                    path = %path,
                    retry_after_secs = retry_after,
                    "rate limit exceeded"
                );
                let resp = rate_limit_response(message, retry_after).map(Into::into);
                Box::pin(async move { Ok(resp) })
            }
        }
    }
}

/// Extract the client IP from proxy headers: `CF-Connecting-IP` first, then
/// the rightmost `X-Forwarded-For` entry.
fn extract_ip_from_headers(headers: &http::HeaderMap) -> Option<IpAddr> {
    if let Some(ip) = header_str(headers, "cf-connecting-ip").and_then(|s| s.parse().ok()) {
        return Some(ip);
    }
    if let Some(xff) = header_str(headers, "x-forwarded-for")
        && let Some(ip) = xff
            .rsplit(',')
            .next()
            .map(str::trim)
            .and_then(|s| s.parse().ok())
    {
        return Some(ip);
    }
    None
}

fn rate_limit_response(message: &str, retry_after: u64) -> Response<Body> {
    let body = format!(r#"{{"ok":false,"error":"{message}"}}"#);
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/json"));
    response.headers_mut().insert(
        "retry-after",
        HeaderValue::from_str(&retry_after.to_string()).unwrap(),
    );
    response
}
