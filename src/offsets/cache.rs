//! TTL cache coordinator for the merged offset payload.
//!
//! Holds the last-good snapshot and all refresh bookkeeping behind one
//! mutex. A refresh runs as a spawned task shared through a cloneable
//! future handle: concurrent callers arriving while the cache is cold or
//! expired join that one refresh instead of starting their own, and a
//! started refresh always runs to completion. When a refresh fails and a
//! prior snapshot exists, callers get the stale snapshot annotated with the
//! error instead of a hard failure.

use crate::offsets::errors::{CacheError, FetchError};
use crate::offsets::fetch::FetchJson;
use crate::offsets::merge::{self, RequiredKeys};
use crate::utils::fmt_duration;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of the most recent refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Never,
    Ok,
    Error,
}

/// Point-in-time diagnostic view of the cache, attached to every response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub ttl_ms: i64,
    pub status: FetchStatus,
    pub fetch_count: u64,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub age_ms: Option<i64>,
    pub remaining_ms: Option<i64>,
    pub remaining_seconds: Option<i64>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// The response body served from `/offsets`. Re-wrapped per response: the
/// cached snapshot is immutable, but `timestamp` and `cache` are recomputed
/// for every caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub ok: bool,
    pub timestamp: DateTime<Utc>,
    pub offsets: Map<String, Value>,
    pub missing_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cache: CacheInfo,
}

/// The two upstream document locations.
#[derive(Debug, Clone)]
pub struct UpstreamUrls {
    pub offsets: String,
    pub client_dll: String,
}

/// Last successfully merged result. Replaced wholesale on each successful
/// refresh, kept across failed ones to support stale serving.
#[derive(Debug, Clone)]
struct Snapshot {
    offsets: Map<String, Value>,
    missing_keys: Vec<String>,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Payload, CacheError>>>;

/// All mutable cache state. `snapshot` is non-None iff at least one refresh
/// ever succeeded; a failed refresh never clears it.
struct CacheState {
    snapshot: Option<Snapshot>,
    last_fetch_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    last_fetch_epoch_ms: Option<i64>,
    status: FetchStatus,
    last_error: Option<String>,
    fetch_count: u64,
    last_duration_ms: Option<u64>,
    /// Single-flight slot: present while a refresh is in flight.
    in_flight: Option<RefreshFuture>,
}

impl CacheState {
    fn new() -> Self {
        Self {
            snapshot: None,
            last_fetch_at: None,
            expires_at: None,
            last_fetch_epoch_ms: None,
            status: FetchStatus::Never,
            last_error: None,
            fetch_count: 0,
            last_duration_ms: None,
            in_flight: None,
        }
    }
}

/// Shared cache coordinator. Clone-cheap (Arc-backed internals).
#[derive(Clone)]
pub struct OffsetCache {
    state: Arc<Mutex<CacheState>>,
    fetcher: Arc<dyn FetchJson>,
    urls: Arc<UpstreamUrls>,
    keys: Arc<RequiredKeys>,
    ttl_ms: i64,
}

impl OffsetCache {
    pub fn new(
        fetcher: Arc<dyn FetchJson>,
        urls: UpstreamUrls,
        keys: RequiredKeys,
        ttl: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::new())),
            fetcher,
            urls: Arc::new(urls),
            keys: Arc::new(keys),
            ttl_ms: ttl.as_millis() as i64,
        }
    }

    /// Get the current payload, refreshing if the cache is cold or expired.
    ///
    /// Fresh reads never touch the network. Cold or expired reads join the
    /// in-flight refresh when one exists, otherwise they start one; every
    /// joined caller receives the same payload (or the same error).
    pub async fn get(&self) -> Result<Payload, CacheError> {
        let join = {
            let mut state = self.state.lock().await;
            let now = Utc::now();

            if let (Some(snapshot), Some(fetched_ms)) =
                (&state.snapshot, state.last_fetch_epoch_ms)
                && now.timestamp_millis() - fetched_ms < self.ttl_ms
            {
                debug!(
                    age_ms = now.timestamp_millis() - fetched_ms,
                    "serving fresh cached payload"
                );
                return Ok(self.wrap(snapshot.clone(), &state, now, None, None));
            }

            match &state.in_flight {
                Some(handle) => {
                    debug!("joining in-flight refresh");
                    handle.clone()
                }
                None => {
                    let handle = self.spawn_refresh();
                    state.in_flight = Some(handle.clone());
                    handle
                }
            }
        };

        join.await
    }

    /// Diagnostic view of the current cache state. Read-only.
    pub async fn info(&self) -> CacheInfo {
        let state = self.state.lock().await;
        self.info_from(&state, Utc::now())
    }

    /// Spawn the refresh task and wrap its join handle in a cloneable
    /// future. Spawning (rather than sharing the refresh future directly)
    /// guarantees the refresh runs to completion even if every waiting
    /// caller is dropped. The unwind guard keeps a panicking refresh from
    /// leaving the single-flight slot occupied forever.
    fn spawn_refresh(&self) -> RefreshFuture {
        let cache = self.clone();
        let task = tokio::spawn(async move {
            let result = match AssertUnwindSafe(cache.refresh()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(CacheError::new(panic_message(panic.as_ref()))),
            };
            cache.state.lock().await.in_flight = None;
            result
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(CacheError::new(format!("refresh task failed: {err}"))),
            }
        }
        .boxed()
        .shared()
    }

    /// Fetch both documents concurrently, merge, and install the result.
    ///
    /// Failures are converted into coordinator state rather than propagated,
    /// except on a cold cache where no stale fallback exists.
    async fn refresh(&self) -> Result<Payload, CacheError> {
        let start = Instant::now();

        let fetched = tokio::try_join!(
            self.fetch(&self.urls.offsets),
            self.fetch(&self.urls.client_dll),
        );

        let now = Utc::now();
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut state = self.state.lock().await;
        state.fetch_count += 1;
        state.last_duration_ms = Some(duration_ms);

        match fetched {
            Ok((offsets_doc, client_doc)) => {
                let merged = merge::merge_documents(&offsets_doc, &client_doc);
                let (offsets, missing_keys) = merge::project(&merged, &self.keys);
                if !missing_keys.is_empty() {
                    warn!(missing = ?missing_keys, "required keys absent after merge");
                }

                let snapshot = Snapshot {
                    offsets,
                    missing_keys,
                };
                state.snapshot = Some(snapshot.clone());
                state.status = FetchStatus::Ok;
                state.last_error = None;
                state.last_fetch_at = Some(now);
                state.expires_at = Some(now + chrono::Duration::milliseconds(self.ttl_ms));
                state.last_fetch_epoch_ms = Some(now.timestamp_millis());

                info!(
                    keys = snapshot.offsets.len(),
                    elapsed = fmt_duration(start.elapsed()),
                    "offset cache refreshed"
                );

                Ok(self.wrap(snapshot, &state, now, None, None))
            }
            Err(err) => {
                let message = err.to_string();
                state.status = FetchStatus::Error;
                state.last_error = Some(message.clone());
                warn!(
                    error = %message,
                    elapsed = fmt_duration(start.elapsed()),
                    "offset refresh failed"
                );

                match state.snapshot.clone() {
                    Some(snapshot) => {
                        Ok(self.wrap(snapshot, &state, now, Some(true), Some(message)))
                    }
                    None => Err(CacheError::new(message)),
                }
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Value, FetchError> {
        self.fetcher.fetch_json(url).await
    }

    fn wrap(
        &self,
        snapshot: Snapshot,
        state: &CacheState,
        now: DateTime<Utc>,
        stale: Option<bool>,
        error: Option<String>,
    ) -> Payload {
        Payload {
            ok: true,
            timestamp: now,
            offsets: snapshot.offsets,
            missing_keys: snapshot.missing_keys,
            stale,
            error,
            cache: self.info_from(state, now),
        }
    }

    fn info_from(&self, state: &CacheState, now: DateTime<Utc>) -> CacheInfo {
        let age_ms = state
            .last_fetch_epoch_ms
            .map(|ms| now.timestamp_millis() - ms);
        let remaining_ms = age_ms.map(|age| (self.ttl_ms - age).max(0));
        CacheInfo {
            ttl_ms: self.ttl_ms,
            status: state.status,
            fetch_count: state.fetch_count,
            last_fetch_at: state.last_fetch_at,
            expires_at: state.expires_at,
            age_ms,
            remaining_ms,
            remaining_seconds: remaining_ms.map(|ms| ms / 1000),
            last_duration_ms: state.last_duration_ms,
            last_error: state.last_error.clone(),
        }
    }

    /// Age the cached snapshot past the TTL without touching its contents.
    #[cfg(test)]
    pub(crate) async fn force_expire(&self) {
        let mut state = self.state.lock().await;
        if let Some(ms) = state.last_fetch_epoch_ms {
            state.last_fetch_epoch_ms = Some(ms - self.ttl_ms - 1);
        }
    }
}

/// Extract a readable message from a panic payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("refresh panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("refresh panicked: {s}")
    } else {
        "refresh panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::future::join_all;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn offsets_doc() -> Value {
        json!({
            "client.dll": {
                "dwEntityList": 25097728,
                "dwLocalPlayerPawn": 24956160,
                "dwViewMatrix": 26173600,
            },
            "engine2.dll": { "dwBuildNumber": 5440852 },
        })
    }

    fn client_dll_doc() -> Value {
        json!({
            "client.dll": {
                "classes": {
                    "C_BaseEntity": {
                        "fields": {
                            "m_iHealth": 836,
                            "m_lifeState": 840,
                            "m_iTeamNum": 995,
                            "m_pGameSceneNode": 800,
                        }
                    },
                    "CSkeletonInstance": {
                        "fields": { "m_modelState": 352, "m_nodeToWorld": 436 }
                    },
                }
            }
        })
    }

    /// Counts calls; fails or panics on demand; sleeps to widen the refresh
    /// window so concurrent callers reliably land while a refresh is in
    /// flight.
    struct ScriptedFetcher {
        calls: AtomicUsize,
        fail: AtomicBool,
        panic: AtomicBool,
        delay: Duration,
    }

    impl ScriptedFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                panic: AtomicBool::new(false),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        fn set_panic(&self, panic: bool) {
            self.panic.store(panic, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FetchJson for ScriptedFetcher {
        async fn fetch_json(&self, url: &str) -> Result<Value, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.panic.load(Ordering::SeqCst) {
                panic!("fetcher exploded");
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(FetchError::new(url, anyhow::anyhow!("connection refused")));
            }
            if url.contains("client_dll") {
                Ok(client_dll_doc())
            } else {
                Ok(offsets_doc())
            }
        }
    }

    fn test_cache(fetcher: Arc<ScriptedFetcher>) -> OffsetCache {
        OffsetCache::new(
            fetcher,
            UpstreamUrls {
                offsets: "http://upstream.test/offsets.json".into(),
                client_dll: "http://upstream.test/client_dll.json".into(),
            },
            RequiredKeys::default(),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn refresh_merges_and_projects_both_documents() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let cache = test_cache(fetcher.clone());

        let payload = cache.get().await.unwrap();
        assert!(payload.ok);
        assert_eq!(payload.offsets["dwViewMatrix"], 26173600);
        assert_eq!(payload.offsets["m_iHealth"], 836);
        assert_eq!(payload.offsets["m_boneArray"], 128);
        assert_eq!(
            payload.missing_keys,
            vec!["m_hPlayerPawn", "m_vOldOrigin", "m_sSanitizedPlayerName"]
        );
        assert_eq!(payload.cache.status, FetchStatus::Ok);
        assert_eq!(payload.cache.fetch_count, 1);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn fresh_reads_perform_no_fetch() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let cache = test_cache(fetcher.clone());

        let first = cache.get().await.unwrap();
        let second = cache.get().await.unwrap();

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(first.offsets, second.offsets);
        assert_eq!(second.stale, None);
        assert_eq!(second.cache.fetch_count, 1);
    }

    #[tokio::test]
    async fn expired_cache_triggers_new_refresh() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let cache = test_cache(fetcher.clone());

        cache.get().await.unwrap();
        cache.force_expire().await;
        let payload = cache.get().await.unwrap();

        assert_eq!(fetcher.calls(), 4);
        assert_eq!(payload.cache.fetch_count, 2);
        assert_eq!(payload.stale, None);
    }

    #[tokio::test]
    async fn single_flight_dedupes_concurrent_refreshes() {
        let fetcher = Arc::new(ScriptedFetcher::with_delay(Duration::from_millis(50)));
        let cache = test_cache(fetcher.clone());

        let results = join_all((0..8).map(|_| cache.get())).await;

        // One refresh = one fetch per upstream document, regardless of callers.
        assert_eq!(fetcher.calls(), 2);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            let payload = result.as_ref().unwrap();
            assert_eq!(payload.offsets, first.offsets);
            assert_eq!(payload.cache.fetch_count, 1);
        }
    }

    #[tokio::test]
    async fn single_flight_shares_cold_failure() {
        let fetcher = Arc::new(ScriptedFetcher::with_delay(Duration::from_millis(50)));
        fetcher.set_fail(true);
        let cache = test_cache(fetcher.clone());

        let results = join_all((0..4).map(|_| cache.get())).await;

        for result in &results {
            assert!(result.is_err());
        }
        let info = cache.info().await;
        assert_eq!(info.fetch_count, 1);
    }

    #[tokio::test]
    async fn stale_fallback_after_failed_refresh() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let cache = test_cache(fetcher.clone());

        let first = cache.get().await.unwrap();
        fetcher.set_fail(true);
        cache.force_expire().await;

        let payload = cache.get().await.unwrap();
        assert!(payload.ok);
        assert_eq!(payload.stale, Some(true));
        assert!(payload.error.as_ref().unwrap().contains("connection refused"));
        assert_eq!(payload.offsets, first.offsets);
        assert_eq!(payload.cache.status, FetchStatus::Error);
        assert_eq!(payload.cache.fetch_count, 2);
    }

    #[tokio::test]
    async fn successful_refresh_clears_previous_error() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let cache = test_cache(fetcher.clone());

        cache.get().await.unwrap();
        fetcher.set_fail(true);
        cache.force_expire().await;
        cache.get().await.unwrap();

        fetcher.set_fail(false);
        cache.force_expire().await;
        let payload = cache.get().await.unwrap();

        assert_eq!(payload.stale, None);
        assert_eq!(payload.cache.status, FetchStatus::Ok);
        assert_eq!(payload.cache.last_error, None);
        assert_eq!(payload.cache.fetch_count, 3);
    }

    #[tokio::test]
    async fn panicked_refresh_releases_single_flight_slot() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.set_panic(true);
        let cache = test_cache(fetcher.clone());

        let err = cache.get().await.unwrap_err();
        assert!(err.message.contains("fetcher exploded"));

        // The slot must be free again: a later get starts a new refresh.
        fetcher.set_panic(false);
        let payload = cache.get().await.unwrap();
        assert_eq!(payload.cache.status, FetchStatus::Ok);
        assert_eq!(payload.offsets["m_iHealth"], 836);
    }

    #[tokio::test]
    async fn cold_failure_surfaces_cache_error() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.set_fail(true);
        let cache = test_cache(fetcher.clone());

        let err = cache.get().await.unwrap_err();
        assert!(err.message.contains("connection refused"));

        let info = cache.info().await;
        assert_eq!(info.status, FetchStatus::Error);
        assert_eq!(info.fetch_count, 1);
        assert_eq!(info.age_ms, None);
        assert!(info.last_error.is_some());
    }

    #[tokio::test]
    async fn info_is_null_before_first_fetch() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let cache = test_cache(fetcher);

        let info = cache.info().await;
        assert_eq!(info.status, FetchStatus::Never);
        assert_eq!(info.fetch_count, 0);
        assert_eq!(info.age_ms, None);
        assert_eq!(info.remaining_ms, None);
        assert_eq!(info.remaining_seconds, None);
        assert_eq!(info.last_fetch_at, None);
    }

    #[tokio::test]
    async fn info_age_and_remaining_sum_to_ttl() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let cache = test_cache(fetcher);

        cache.get().await.unwrap();
        let info = cache.info().await;
        let (age, remaining) = (info.age_ms.unwrap(), info.remaining_ms.unwrap());
        assert!(age >= 0);
        assert_eq!(age + remaining, info.ttl_ms);
        assert_eq!(info.remaining_seconds.unwrap(), remaining / 1000);

        cache.force_expire().await;
        let info = cache.info().await;
        assert_eq!(info.remaining_ms, Some(0));
    }
}
