//! Fetch interceptor: decides per request whether to consult the cache before
//! or after the network.
//!
//! - API requests (same origin, API path prefix): network-first, then cache,
//!   then a JSON 503 placeholder
//! - other same-origin requests: cache-first, then network, then the offline
//!   page (HTML navigations) or a 404
//! - cross-origin requests: network-first, then cache, then a plain 503
//!
//! Non-GET requests are never intercepted.

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::traits::{CacheResult, CacheStorage, CachedEntry, RequestKey};
use crate::coordinator::CoordinatorConfig;
use crate::net::{attempt_network, Network, Request, Response};

pub const OFFLINE_MESSAGE: &str = "Offline mode - data not available";

/// Routing class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Api,
  Static,
  CrossOrigin,
}

/// What the interceptor did with a request.
#[derive(Debug)]
pub enum FetchDecision {
  /// Not intercepted; the caller talks to the network directly
  Passthrough,
  /// Answered by the interceptor
  Respond(CacheResult<Response>),
}

/// Placeholder used when an API request can be served neither by the network
/// nor by the cache.
pub fn offline_json_response(now: DateTime<Utc>) -> Response {
  Response::json(
    503,
    &serde_json::json!({
      "error": OFFLINE_MESSAGE,
      "timestamp": now.to_rfc3339_opts(SecondsFormat::Millis, true),
    }),
  )
}

pub fn offline_text_response() -> Response {
  Response::text(503, "Offline")
}

pub fn not_found_response() -> Response {
  Response::text(404, "Not Found")
}

/// Cache layer that sits between the application and the network.
pub struct FetchInterceptor<S> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  config: CoordinatorConfig,
}

impl<S: CacheStorage> FetchInterceptor<S> {
  pub fn new(storage: Arc<S>, network: Arc<dyn Network>, config: CoordinatorConfig) -> Self {
    Self {
      storage,
      network,
      config,
    }
  }

  pub fn classify(&self, url: &Url) -> RequestClass {
    if url.origin() != self.config.origin.origin() {
      RequestClass::CrossOrigin
    } else if url.path().starts_with(&self.config.api_prefix) {
      RequestClass::Api
    } else {
      RequestClass::Static
    }
  }

  pub async fn handle(&self, request: &Request) -> FetchDecision {
    if request.method != Method::GET {
      return FetchDecision::Passthrough;
    }

    let result = match self.classify(&request.url) {
      RequestClass::Api => {
        self
          .network_first(request, || offline_json_response(Utc::now()))
          .await
      }
      RequestClass::CrossOrigin => self.network_first(request, offline_text_response).await,
      RequestClass::Static => self.cache_first(request).await,
    };

    FetchDecision::Respond(result)
  }

  /// 1. Try the network; store successful responses
  /// 2. On failure, serve the most recent cached copy
  /// 3. Otherwise, synthesize a placeholder
  async fn network_first<F>(&self, request: &Request, placeholder: F) -> CacheResult<Response>
  where
    F: FnOnce() -> Response,
  {
    let key = RequestKey::of(request);

    match attempt_network(
      self.network.as_ref(),
      request,
      self.config.network_first_timeout,
    )
    .await
    {
      Ok(response) => {
        self.store(&key, &response);
        CacheResult::from_network(response)
      }
      Err(failure) => {
        debug!(url = %request.url, %failure, "network-first fetch failed, trying cache");
        match self.lookup(&key) {
          Some(entry) => CacheResult::from_cache(entry.to_response()),
          None => CacheResult::fallback(placeholder()),
        }
      }
    }
  }

  /// 1. Serve from cache without touching the network
  /// 2. On a miss, fetch and store
  /// 3. If that fails, serve the offline page or a 404
  async fn cache_first(&self, request: &Request) -> CacheResult<Response> {
    let key = RequestKey::of(request);

    if let Some(entry) = self.lookup(&key) {
      return CacheResult::from_cache(entry.to_response());
    }

    match attempt_network(
      self.network.as_ref(),
      request,
      self.config.cache_first_timeout,
    )
    .await
    {
      Ok(response) => {
        self.store(&key, &response);
        CacheResult::from_network(response)
      }
      Err(failure) => {
        debug!(url = %request.url, %failure, "cache miss and network unavailable");
        if request.accepts_html() {
          if let Some(page) = self.lookup(&RequestKey::get(self.config.offline_page.clone())) {
            return CacheResult::fallback(page.to_response());
          }
        }
        CacheResult::fallback(not_found_response())
      }
    }
  }

  /// Best effort: a failed write never prevents serving the response.
  fn store(&self, key: &RequestKey, response: &Response) {
    let Some(entry) = CachedEntry::snapshot(response) else {
      return;
    };

    if let Err(e) = self
      .storage
      .put(&self.config.dynamic_cache_name, key, &entry)
    {
      warn!(url = %key.url, error = %e, "failed to cache response");
    }
  }

  fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
    self.storage.match_any(key).unwrap_or_else(|e| {
      warn!(url = %key.url, error = %e, "cache lookup failed");
      None
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::coordinator::tests::test_config;
  use crate::net::fake::FakeNetwork;
  use color_eyre::{eyre::eyre, Result};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  /// Wraps a real store, counting calls and optionally failing writes.
  struct ProbeStorage {
    inner: SqliteStorage,
    calls: AtomicUsize,
    fail_writes: bool,
  }

  impl ProbeStorage {
    fn new(fail_writes: bool) -> Self {
      Self {
        inner: SqliteStorage::open_in_memory().unwrap(),
        calls: AtomicUsize::new(0),
        fail_writes,
      }
    }

    fn touch(&self) {
      self.calls.fetch_add(1, Ordering::SeqCst);
    }
  }

  impl CacheStorage for ProbeStorage {
    fn open(&self, name: &str) -> Result<()> {
      self.touch();
      self.inner.open(name)
    }
    fn keys(&self) -> Result<Vec<String>> {
      self.touch();
      self.inner.keys()
    }
    fn delete(&self, name: &str) -> Result<bool> {
      self.touch();
      self.inner.delete(name)
    }
    fn put(&self, name: &str, key: &RequestKey, entry: &CachedEntry) -> Result<()> {
      self.touch();
      if self.fail_writes {
        return Err(eyre!("quota exceeded"));
      }
      self.inner.put(name, key, entry)
    }
    fn put_all(&self, name: &str, entries: &[(RequestKey, CachedEntry)]) -> Result<()> {
      self.touch();
      self.inner.put_all(name, entries)
    }
    fn match_in(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
      self.touch();
      self.inner.match_in(name, key)
    }
    fn match_any(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
      self.touch();
      self.inner.match_any(key)
    }
    fn entry_count(&self, name: &str) -> Result<usize> {
      self.inner.entry_count(name)
    }
  }

  fn interceptor<S: CacheStorage>(
    storage: &Arc<S>,
    network: &Arc<FakeNetwork>,
  ) -> FetchInterceptor<S> {
    FetchInterceptor::new(Arc::clone(storage), network.clone(), test_config())
  }

  fn get(url: &str) -> Request {
    Request::get(url.parse().unwrap())
  }

  fn respond(decision: FetchDecision) -> CacheResult<Response> {
    match decision {
      FetchDecision::Respond(result) => result,
      FetchDecision::Passthrough => panic!("expected the interceptor to respond"),
    }
  }

  fn cached(path: &str, body: &str) -> (RequestKey, CachedEntry) {
    (
      RequestKey::get(format!("https://app.test{}", path).parse().unwrap()),
      CachedEntry::snapshot(&Response::text(200, body)).unwrap(),
    )
  }

  #[test]
  fn test_classify() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    let interceptor = interceptor(&storage, &network);

    let class = |url: &str| interceptor.classify(&url.parse::<Url>().unwrap());
    assert_eq!(class("https://app.test/api/lessons"), RequestClass::Api);
    assert_eq!(class("https://app.test/static/app.js"), RequestClass::Static);
    assert_eq!(class("https://app.test/"), RequestClass::Static);
    assert_eq!(class("https://cdn.test/api/lib.js"), RequestClass::CrossOrigin);
    assert_eq!(class("http://app.test/api/lessons"), RequestClass::CrossOrigin);
  }

  #[tokio::test]
  async fn test_api_success_is_returned_and_cached() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let body = r#"{"lessons":[{"id":1}]}"#;
    let network = Arc::new(FakeNetwork::new().route(
      "https://app.test/api/lessons",
      Response::new(200, body.as_bytes().to_vec()),
    ));

    let result = respond(
      interceptor(&storage, &network)
        .handle(&get("https://app.test/api/lessons"))
        .await,
    );

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, body.as_bytes());
    let key = RequestKey::get("https://app.test/api/lessons".parse().unwrap());
    let stored = storage.match_in("dynamic-v1", &key).unwrap().unwrap();
    assert_eq!(stored.body, body.as_bytes());
  }

  #[tokio::test]
  async fn test_api_offline_serves_cached_copy() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (key, entry) = cached("/api/lessons", r#"{"lessons":[]}"#);
    storage.put("dynamic-v1", &key, &entry).unwrap();
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);

    let result = respond(
      interceptor(&storage, &network)
        .handle(&get("https://app.test/api/lessons"))
        .await,
    );

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.status, 200);
    assert_eq!(result.data.body, br#"{"lessons":[]}"#);
  }

  #[tokio::test]
  async fn test_api_offline_without_cache_returns_json_placeholder() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);

    let result = respond(
      interceptor(&storage, &network)
        .handle(&get("https://app.test/api/progress"))
        .await,
    );

    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.status, 503);
    assert_eq!(result.data.header("content-type"), Some("application/json"));
    let body: serde_json::Value = serde_json::from_slice(&result.data.body).unwrap();
    let object = body.as_object().unwrap();
    assert_eq!(object.len(), 2);
    assert_eq!(object["error"], OFFLINE_MESSAGE);
    let timestamp = object["timestamp"].as_str().unwrap();
    assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
  }

  #[tokio::test]
  async fn test_api_timeout_falls_back_to_cache() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (key, entry) = cached("/api/lessons", "cached");
    storage.put("dynamic-v1", &key, &entry).unwrap();
    let network = Arc::new(
      FakeNetwork::new()
        .route("https://app.test/api/lessons", Response::text(200, "late"))
        .with_delay(Duration::from_millis(500)),
    );
    let mut config = test_config();
    config.network_first_timeout = Duration::from_millis(20);
    let interceptor = FetchInterceptor::new(Arc::clone(&storage), network, config);

    let result = respond(interceptor.handle(&get("https://app.test/api/lessons")).await);

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"cached");
  }

  #[tokio::test]
  async fn test_api_error_status_is_passed_through_uncached() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new().route(
      "https://app.test/api/lessons",
      Response::text(500, "boom"),
    ));

    let result = respond(
      interceptor(&storage, &network)
        .handle(&get("https://app.test/api/lessons"))
        .await,
    );

    assert_eq!(result.data.status, 500);
    assert_eq!(storage.entry_count("dynamic-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_static_hit_skips_network() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (key, entry) = cached("/static/app.js", "console.log(1)");
    storage.put("static-v1", &key, &entry).unwrap();
    let network = Arc::new(FakeNetwork::new());

    let result = respond(
      interceptor(&storage, &network)
        .handle(&get("https://app.test/static/app.js"))
        .await,
    );

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"console.log(1)");
    assert_eq!(network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_static_miss_fetches_and_stores_in_dynamic() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new().route(
      "https://app.test/img/logo.png",
      Response::new(200, vec![1, 2, 3]),
    ));
    let interceptor = interceptor(&storage, &network);

    let first = respond(interceptor.handle(&get("https://app.test/img/logo.png")).await);
    let second = respond(interceptor.handle(&get("https://app.test/img/logo.png")).await);

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data.body, vec![1, 2, 3]);
    assert_eq!(network.call_count(), 1);
    assert_eq!(
      storage.keys().unwrap(),
      vec!["dynamic-v1".to_string()]
    );
  }

  #[tokio::test]
  async fn test_static_navigation_offline_serves_offline_page() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (key, entry) = cached("/offline.html", "<h1>offline</h1>");
    storage.put("static-v1", &key, &entry).unwrap();
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);
    let interceptor = interceptor(&storage, &network);

    let page = respond(
      interceptor
        .handle(&get("https://app.test/lessons/3").with_header("accept", "text/html"))
        .await,
    );
    let asset = respond(interceptor.handle(&get("https://app.test/lessons/3.json")).await);

    assert_eq!(page.source, CacheSource::Fallback);
    assert_eq!(page.data.body, b"<h1>offline</h1>");
    assert_eq!(asset.data.status, 404);
  }

  #[tokio::test]
  async fn test_static_navigation_without_offline_page_is_404() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);

    let result = respond(
      interceptor(&storage, &network)
        .handle(&get("https://app.test/about").with_header("accept", "text/html"))
        .await,
    );

    assert_eq!(result.data.status, 404);
  }

  #[tokio::test]
  async fn test_cross_origin_offline_returns_plain_503() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);

    let result = respond(
      interceptor(&storage, &network)
        .handle(&get("https://cdn.test/font.woff2"))
        .await,
    );

    assert_eq!(result.data.status, 503);
    assert_eq!(result.data.body, b"Offline");
  }

  #[tokio::test]
  async fn test_cross_origin_success_is_cached() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(
      FakeNetwork::new().route("https://cdn.test/font.woff2", Response::new(200, vec![9])),
    );
    let interceptor = interceptor(&storage, &network);
    interceptor.handle(&get("https://cdn.test/font.woff2")).await;
    network.set_offline(true);

    let result = respond(interceptor.handle(&get("https://cdn.test/font.woff2")).await);

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, vec![9]);
  }

  #[tokio::test]
  async fn test_non_get_requests_never_touch_the_cache() {
    let storage = Arc::new(ProbeStorage::new(false));
    let network = Arc::new(FakeNetwork::new());
    let interceptor = interceptor(&storage, &network);

    for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
      let request = Request::new(method, "https://app.test/api/progress".parse().unwrap());
      assert!(matches!(
        interceptor.handle(&request).await,
        FetchDecision::Passthrough
      ));
    }

    assert_eq!(storage.calls.load(Ordering::SeqCst), 0);
    assert_eq!(network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_cache_write_failure_still_serves_response() {
    let storage = Arc::new(ProbeStorage::new(true));
    let network = Arc::new(FakeNetwork::new().route(
      "https://app.test/api/lessons",
      Response::text(200, "fresh"),
    ));

    let result = respond(
      interceptor(&storage, &network)
        .handle(&get("https://app.test/api/lessons"))
        .await,
    );

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"fresh");
    assert!(storage.inner.keys().unwrap().is_empty());
  }
}
