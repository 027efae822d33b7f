//! Versioned request cache with per-request-class serving policy.
//!
//! Policy, by request class:
//! - navigation / HTML (`Accept` contains `text/html`): network first; on
//!   transport failure the cached copy, else the offline page. Successful
//!   responses refresh the cache.
//! - other GETs: cache first; on a miss, network, then the offline page.
//!   A cache hit outside the API path triggers a background refetch; API
//!   paths are never refreshed behind the caller's back.
//! - non-GET or non-http(s) requests: not intercepted.
//!
//! Only `200` responses are written to cache. Cache writes and refreshes run
//! on a task tracker so they never delay the response.

use async_trait::async_trait;
use reqwest::{Method, Url};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::TransportError;
use crate::config::OfflineConfig;
use crate::db;
use crate::store::{run_blocking, StoreError};

const OFFLINE_BODY: &str = "Offline - resource unavailable";

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CacheRequest {
    pub method: Method,
    pub url: String,
    pub accept: Option<String>,
}

impl CacheRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            accept: None,
        }
    }

    /// A page navigation (`Accept: text/html`).
    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            accept: Some("text/html,application/xhtml+xml,*/*;q=0.8".to_string()),
            ..Self::get(url)
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.accept
            .as_deref()
            .map(|a| a.contains("text/html"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Last-resort answer when neither network nor cache can serve.
    pub fn service_unavailable() -> Self {
        Self {
            status: 503,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: OFFLINE_BODY.as_bytes().to_vec(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected status {0}")]
    Status(u16),
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Named caches of responses, keyed by absolute URL.
pub struct CacheStorage {
    conn: Arc<Mutex<Connection>>,
}

impl CacheStorage {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_connection(db::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_connection(db::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn put(
        &self,
        cache: &str,
        url: &str,
        response: &CachedResponse,
    ) -> Result<(), StoreError> {
        let cache = cache.to_string();
        let url = url.to_string();
        let headers = serde_json::to_string(&response.headers)?;
        let status = response.status;
        let body = response.body.clone();
        run_blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO cache_entries (cache_name, url, status, headers, body, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
                 ON CONFLICT(cache_name, url) DO UPDATE SET
                    status = excluded.status,
                    headers = excluded.headers,
                    body = excluded.body,
                    stored_at = excluded.stored_at",
                params![cache, url, status, headers, body],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn match_url(
        &self,
        cache: &str,
        url: &str,
    ) -> Result<Option<CachedResponse>, StoreError> {
        let cache = cache.to_string();
        let url = url.to_string();
        run_blocking(self.conn.clone(), move |conn| {
            let row = conn
                .query_row(
                    "SELECT status, headers, body FROM cache_entries
                     WHERE cache_name = ?1 AND url = ?2",
                    params![cache, url],
                    |row| {
                        Ok((
                            row.get::<_, u16>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                        ))
                    },
                )
                .optional()?;
            decode_row(row)
        })
        .await
    }

    /// Look `url` up across every cache, preferring `preferred`.
    pub async fn match_any(
        &self,
        url: &str,
        preferred: &str,
    ) -> Result<Option<CachedResponse>, StoreError> {
        let url = url.to_string();
        let preferred = preferred.to_string();
        run_blocking(self.conn.clone(), move |conn| {
            let row = conn
                .query_row(
                    "SELECT status, headers, body FROM cache_entries
                     WHERE url = ?1
                     ORDER BY (cache_name = ?2) DESC, stored_at DESC
                     LIMIT 1",
                    params![url, preferred],
                    |row| {
                        Ok((
                            row.get::<_, u16>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                        ))
                    },
                )
                .optional()?;
            decode_row(row)
        })
        .await
    }

    /// Names of all caches holding at least one entry.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        run_blocking(self.conn.clone(), |conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    /// Drop a whole cache. Returns whether anything was removed.
    pub async fn delete(&self, cache: &str) -> Result<bool, StoreError> {
        let cache = cache.to_string();
        run_blocking(self.conn.clone(), move |conn| {
            let removed = conn.execute(
                "DELETE FROM cache_entries WHERE cache_name = ?1",
                params![cache],
            )?;
            Ok(removed > 0)
        })
        .await
    }
}

fn decode_row(
    row: Option<(u16, String, Vec<u8>)>,
) -> Result<Option<CachedResponse>, StoreError> {
    match row {
        Some((status, headers, body)) => Ok(Some(CachedResponse {
            status,
            headers: serde_json::from_str(&headers)?,
            body,
        })),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Policy + lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Name of the current cache generation.
    pub version: String,
    /// Absolute URLs pre-populated on install.
    pub manifest: Vec<String>,
    /// Absolute URL of the offline fallback page.
    pub offline_page: String,
    pub api_path_marker: String,
}

impl CachePolicy {
    pub fn from_config(config: &OfflineConfig) -> Self {
        Self {
            version: config.cache_version.clone(),
            manifest: config
                .precache_manifest
                .iter()
                .map(|p| config.resolve_url(p))
                .collect(),
            offline_page: config.resolve_url(&config.offline_page),
            api_path_marker: config.api_path_marker.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstallReport {
    pub cached: usize,
    pub failed: Vec<String>,
}

pub struct CacheLayer {
    storage: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    policy: CachePolicy,
    background: TaskTracker,
}

impl CacheLayer {
    pub fn new(storage: Arc<CacheStorage>, fetcher: Arc<dyn Fetcher>, policy: CachePolicy) -> Self {
        Self {
            storage,
            fetcher,
            policy,
            background: TaskTracker::new(),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Pre-populate the current cache with the manifest. A failed entry is
    /// logged and skipped; installation always completes.
    pub async fn install(&self) -> InstallReport {
        info!(cache = %self.policy.version, "Caching core assets");
        let mut report = InstallReport::default();

        for url in &self.policy.manifest {
            match self.precache(url).await {
                Ok(()) => report.cached += 1,
                Err(e) => {
                    warn!(url = %url, error = %e, "Cache install error");
                    report.failed.push(url.clone());
                }
            }
        }

        report
    }

    async fn precache(&self, url: &str) -> Result<(), CacheError> {
        let response = self.fetcher.fetch(&CacheRequest::get(url)).await?;
        if !response.is_ok() {
            return Err(CacheError::Status(response.status));
        }
        self.storage.put(&self.policy.version, url, &response).await?;
        Ok(())
    }

    /// Delete every cache whose name differs from the current version.
    pub async fn activate(&self) -> Vec<String> {
        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Could not list caches on activate");
                return Vec::new();
            }
        };

        let mut deleted = Vec::new();
        for name in names {
            if name == self.policy.version {
                continue;
            }
            info!(cache = %name, "Deleting old cache");
            match self.storage.delete(&name).await {
                Ok(_) => deleted.push(name),
                Err(e) => warn!(cache = %name, error = %e, "Failed to delete old cache"),
            }
        }
        deleted
    }

    /// Serve an intercepted request. `None` means the request is not
    /// intercepted and should go to the network untouched.
    pub async fn handle(&self, request: &CacheRequest) -> Option<CachedResponse> {
        if request.method != Method::GET {
            return None;
        }
        let parsed = Url::parse(&request.url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }

        if request.is_navigation() {
            return Some(self.network_first(request).await);
        }

        let is_api = parsed.path().contains(&self.policy.api_path_marker);
        Some(self.cache_first(request, is_api).await)
    }

    async fn network_first(&self, request: &CacheRequest) -> CachedResponse {
        match self.fetcher.fetch(request).await {
            Ok(resp) => {
                if resp.is_ok() {
                    self.store_in_background(request.url.clone(), resp.clone());
                }
                resp
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                match self.lookup(&request.url).await {
                    Some(cached) => cached,
                    None => self.offline_fallback().await,
                }
            }
        }
    }

    async fn cache_first(&self, request: &CacheRequest, is_api: bool) -> CachedResponse {
        if let Some(cached) = self.lookup(&request.url).await {
            if !is_api {
                self.refresh_in_background(request.clone());
            }
            return cached;
        }

        match self.fetcher.fetch(request).await {
            Ok(resp) => {
                if resp.is_ok() {
                    self.store_in_background(request.url.clone(), resp.clone());
                }
                resp
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed with no cached copy");
                self.offline_fallback().await
            }
        }
    }

    async fn lookup(&self, url: &str) -> Option<CachedResponse> {
        match self.storage.match_any(url, &self.policy.version).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(url, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    async fn offline_fallback(&self) -> CachedResponse {
        match self.lookup(&self.policy.offline_page).await {
            Some(page) => page,
            None => CachedResponse::service_unavailable(),
        }
    }

    fn store_in_background(&self, url: String, response: CachedResponse) {
        let storage = self.storage.clone();
        let cache = self.policy.version.clone();
        self.background.spawn(async move {
            if let Err(e) = storage.put(&cache, &url, &response).await {
                warn!(url = %url, error = %e, "Cache write failed");
            }
        });
    }

    fn refresh_in_background(&self, request: CacheRequest) {
        let storage = self.storage.clone();
        let fetcher = self.fetcher.clone();
        let cache = self.policy.version.clone();
        self.background.spawn(async move {
            match fetcher.fetch(&request).await {
                Ok(resp) if resp.is_ok() => {
                    if let Err(e) = storage.put(&cache, &request.url, &resp).await {
                        warn!(url = %request.url, error = %e, "Cache refresh write failed");
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(url = %request.url, error = %e, "Background refresh failed"),
            }
        });
    }

    /// Wait for every background cache write and refresh issued so far.
    pub async fn settle(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const BASE: &str = "http://pos.test";

    /// In-memory network: URL -> response; `offline` makes every fetch fail.
    #[derive(Default)]
    struct FakeNetwork {
        responses: Mutex<HashMap<String, CachedResponse>>,
        offline: std::sync::atomic::AtomicBool,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeNetwork {
        fn serve(&self, path: &str, status: u16, body: &str) {
            self.responses.lock().unwrap().insert(
                format!("{BASE}{path}"),
                CachedResponse {
                    status,
                    headers: vec![],
                    body: body.as_bytes().to_vec(),
                },
            );
        }

        fn set_offline(&self, offline: bool) {
            self.offline
                .store(offline, std::sync::atomic::Ordering::SeqCst);
        }

        fn fetch_count(&self, path: &str) -> usize {
            let url = format!("{BASE}{path}");
            self.fetched.lock().unwrap().iter().filter(|u| **u == url).count()
        }
    }

    #[async_trait]
    impl Fetcher for FakeNetwork {
        async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse, TransportError> {
            self.fetched.lock().unwrap().push(request.url.clone());
            if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(TransportError::Unreachable {
                    url: request.url.clone(),
                    reason: "offline".into(),
                });
            }
            Ok(self
                .responses
                .lock()
                .unwrap()
                .get(&request.url)
                .cloned()
                .unwrap_or(CachedResponse {
                    status: 404,
                    headers: vec![],
                    body: b"not found".to_vec(),
                }))
        }
    }

    fn policy(version: &str) -> CachePolicy {
        let config = OfflineConfig {
            server_url: BASE.to_string(),
            cache_version: version.to_string(),
            precache_manifest: vec!["/".into(), "/static/app.js".into(), "/static/offline.html".into()],
            ..OfflineConfig::default()
        };
        CachePolicy::from_config(&config)
    }

    fn layer(network: Arc<FakeNetwork>, version: &str) -> (CacheLayer, Arc<CacheStorage>) {
        let storage = Arc::new(CacheStorage::open_in_memory().unwrap());
        let layer = CacheLayer::new(storage.clone(), network, policy(version));
        (layer, storage)
    }

    fn url(path: &str) -> String {
        format!("{BASE}{path}")
    }

    fn body(resp: &CachedResponse) -> &str {
        std::str::from_utf8(&resp.body).unwrap()
    }

    #[tokio::test]
    async fn test_install_caches_manifest_and_tolerates_failures() {
        let network = Arc::new(FakeNetwork::default());
        network.serve("/", 200, "<html>home</html>");
        network.serve("/static/offline.html", 200, "<html>offline</html>");
        // /static/app.js is missing (404)
        let (layer, storage) = layer(network, "v3");

        let report = layer.install().await;
        assert_eq!(report.cached, 2);
        assert_eq!(report.failed, vec![url("/static/app.js")]);
        assert!(storage.match_url("v3", &url("/")).await.unwrap().is_some());
        assert!(storage
            .match_url("v3", &url("/static/app.js"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_activate_deletes_other_versions() {
        let network = Arc::new(FakeNetwork::default());
        let (layer, storage) = layer(network, "pharmacy-cache-v3");
        let resp = CachedResponse {
            status: 200,
            headers: vec![],
            body: b"x".to_vec(),
        };
        for name in ["pharmacy-cache-v1", "pharmacy-cache-v2", "pharmacy-cache-v3"] {
            storage.put(name, &url("/"), &resp).await.unwrap();
        }

        let deleted = layer.activate().await;
        assert_eq!(deleted, vec!["pharmacy-cache-v1", "pharmacy-cache-v2"]);
        assert_eq!(storage.keys().await.unwrap(), vec!["pharmacy-cache-v3"]);
    }

    #[tokio::test]
    async fn test_non_get_and_non_http_not_intercepted() {
        let network = Arc::new(FakeNetwork::default());
        let (layer, _storage) = layer(network.clone(), "v3");

        let post = CacheRequest::get(url("/sales/new")).with_method(Method::POST);
        assert!(layer.handle(&post).await.is_none());
        assert!(layer
            .handle(&CacheRequest::get("chrome-extension://abc/x.js"))
            .await
            .is_none());
        assert!(network.fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_navigation_is_network_first_and_refreshes_cache() {
        let network = Arc::new(FakeNetwork::default());
        network.serve("/medicines", 200, "v1 list");
        let (layer, storage) = layer(network.clone(), "v3");

        let resp = layer.handle(&CacheRequest::navigate(url("/medicines"))).await.unwrap();
        assert_eq!(body(&resp), "v1 list");
        layer.settle().await;

        network.serve("/medicines", 200, "v2 list");
        let resp = layer.handle(&CacheRequest::navigate(url("/medicines"))).await.unwrap();
        assert_eq!(body(&resp), "v2 list");
        layer.settle().await;

        let cached = storage.match_url("v3", &url("/medicines")).await.unwrap().unwrap();
        assert_eq!(body(&cached), "v2 list");
    }

    #[tokio::test]
    async fn test_navigation_offline_falls_back_to_cache_then_offline_page() {
        let network = Arc::new(FakeNetwork::default());
        network.serve("/dashboard", 200, "dashboard");
        network.serve("/static/offline.html", 200, "offline page");
        let (layer, _storage) = layer(network.clone(), "v3");
        layer.install().await;
        layer.handle(&CacheRequest::navigate(url("/dashboard"))).await;
        layer.settle().await;

        network.set_offline(true);
        let resp = layer.handle(&CacheRequest::navigate(url("/dashboard"))).await.unwrap();
        assert_eq!(body(&resp), "dashboard");

        let resp = layer.handle(&CacheRequest::navigate(url("/reports"))).await.unwrap();
        assert_eq!(body(&resp), "offline page");
    }

    #[tokio::test]
    async fn test_navigation_offline_without_offline_page_is_503() {
        let network = Arc::new(FakeNetwork::default());
        network.set_offline(true);
        let (layer, _storage) = layer(network, "v3");

        let resp = layer.handle(&CacheRequest::navigate(url("/reports"))).await.unwrap();
        assert_eq!(resp, CachedResponse::service_unavailable());
    }

    #[tokio::test]
    async fn test_asset_served_from_cache_unchanged_while_offline() {
        let network = Arc::new(FakeNetwork::default());
        network.serve("/static/app.js", 200, "console.log(1)");
        let (layer, _storage) = layer(network.clone(), "v3");
        layer.install().await;

        network.set_offline(true);
        let first = layer.handle(&CacheRequest::get(url("/static/app.js"))).await.unwrap();
        let second = layer.handle(&CacheRequest::get(url("/static/app.js"))).await.unwrap();
        layer.settle().await;
        assert_eq!(body(&first), "console.log(1)");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_asset_cache_hit_refreshes_in_background() {
        let network = Arc::new(FakeNetwork::default());
        network.serve("/static/app.js", 200, "old");
        let (layer, storage) = layer(network.clone(), "v3");
        layer.install().await;

        network.serve("/static/app.js", 200, "new");
        let resp = layer.handle(&CacheRequest::get(url("/static/app.js"))).await.unwrap();
        assert_eq!(body(&resp), "old", "cached copy is served immediately");

        layer.settle().await;
        let cached = storage
            .match_url("v3", &url("/static/app.js"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body(&cached), "new");
    }

    #[tokio::test]
    async fn test_api_cache_hit_is_not_refreshed() {
        let network = Arc::new(FakeNetwork::default());
        let (layer, storage) = layer(network.clone(), "v3");
        let cached = CachedResponse {
            status: 200,
            headers: vec![],
            body: b"[1,2]".to_vec(),
        };
        storage.put("v3", &url("/api/medicines"), &cached).await.unwrap();
        network.serve("/api/medicines", 200, "[1,2,3]");

        let resp = layer.handle(&CacheRequest::get(url("/api/medicines"))).await.unwrap();
        layer.settle().await;
        assert_eq!(resp, cached);
        assert_eq!(network.fetch_count("/api/medicines"), 0);
    }

    #[tokio::test]
    async fn test_asset_miss_goes_to_network_and_caches_only_200() {
        let network = Arc::new(FakeNetwork::default());
        network.serve("/static/logo.png", 200, "png");
        network.serve("/static/broken.css", 500, "boom");
        let (layer, storage) = layer(network.clone(), "v3");

        let resp = layer.handle(&CacheRequest::get(url("/static/logo.png"))).await.unwrap();
        assert_eq!(body(&resp), "png");
        let resp = layer.handle(&CacheRequest::get(url("/static/broken.css"))).await.unwrap();
        assert_eq!(resp.status, 500);
        layer.settle().await;

        assert!(storage.match_url("v3", &url("/static/logo.png")).await.unwrap().is_some());
        assert!(storage.match_url("v3", &url("/static/broken.css")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_asset_miss_offline_uses_offline_page() {
        let network = Arc::new(FakeNetwork::default());
        network.serve("/static/offline.html", 200, "offline page");
        let (layer, _storage) = layer(network.clone(), "v3");
        layer.install().await;

        network.set_offline(true);
        let resp = layer.handle(&CacheRequest::get(url("/static/missing.js"))).await.unwrap();
        assert_eq!(body(&resp), "offline page");
    }

    #[tokio::test]
    async fn test_lookup_prefers_current_version() {
        let network = Arc::new(FakeNetwork::default());
        network.set_offline(true);
        let (layer, storage) = layer(network, "v3");
        let make = |b: &str| CachedResponse {
            status: 200,
            headers: vec![],
            body: b.as_bytes().to_vec(),
        };
        storage.put("v2", &url("/static/a.js"), &make("stale")).await.unwrap();
        storage.put("v3", &url("/static/a.js"), &make("current")).await.unwrap();
        storage.put("v2", &url("/static/b.js"), &make("only-old")).await.unwrap();

        let a = layer.handle(&CacheRequest::get(url("/static/a.js"))).await.unwrap();
        assert_eq!(body(&a), "current");
        let b = layer.handle(&CacheRequest::get(url("/static/b.js"))).await.unwrap();
        assert_eq!(body(&b), "only-old");
    }
}
