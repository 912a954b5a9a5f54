//! Retrieval pipeline: cache first, then network, with background population
//! and navigation fallback.

use color_eyre::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::diagnostics::{BackgroundTasks, Diagnostics};
use crate::net::{Network, Request, Response, ResponseType};

use super::storage::CacheStorage;
use super::traits::{CachedEntry, RequestKey, Served};

/// Cache layer that sits between intercepted requests and the network.
///
/// It only reads and writes entries; creating and deleting generations is the
/// lifecycle's job.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  /// Generation that receives opportunistic writes
  dynamic: String,
  /// Served to navigations when the network is unreachable
  fallback: Request,
  vary_headers: BTreeSet<String>,
  tasks: Arc<BackgroundTasks>,
  diagnostics: Arc<Diagnostics>,
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    dynamic: String,
    fallback: Request,
    vary_headers: BTreeSet<String>,
    tasks: Arc<BackgroundTasks>,
    diagnostics: Arc<Diagnostics>,
  ) -> Self {
    Self {
      storage,
      network,
      dynamic,
      fallback,
      vary_headers,
      tasks,
      diagnostics,
    }
  }

  /// Only complete same-origin 200s are worth keeping.
  fn should_persist(response: &Response) -> bool {
    response.status == 200 && response.response_type == ResponseType::Basic
  }

  /// Look up a key, treating storage errors as a miss.
  fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
    match self.storage.lookup(key) {
      Ok(entry) => entry,
      Err(e) => {
        self.diagnostics.record("cache lookup", &e);
        None
      }
    }
  }

  /// Produce a response for an accepted request.
  ///
  /// 1. Stored snapshot - returned as is, no network call, no freshness check
  /// 2. Otherwise fetch; a 200 `basic` response is copied into the dynamic
  ///    generation by a detached task
  /// 3. On network failure, navigations get the fallback document; anything
  ///    else is an error
  pub async fn respond(&self, request: &Request) -> Result<Served> {
    let key = RequestKey::from_request(request, &self.vary_headers);

    if let Some(cached) = self.lookup(&key) {
      debug!(
        url = %request.url,
        generation = %cached.generation,
        cached_at = %cached.cached_at,
        "cache hit"
      );
      return Ok(Served::from_cache(cached.response));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if Self::should_persist(&response) {
          self.persist_in_background(key, response.clone());
        }
        Ok(Served::from_network(response))
      }
      Err(e) => {
        if request.is_navigation() {
          let fallback_key = RequestKey::from_request(&self.fallback, &self.vary_headers);
          if let Some(document) = self.lookup(&fallback_key) {
            debug!(url = %request.url, generation = %document.generation, "offline, serving fallback document");
            return Ok(Served::offline(document.response));
          }
        }
        Err(e.wrap_err(format!("{} unavailable offline", request.url)))
      }
    }
  }

  fn persist_in_background(&self, key: RequestKey, response: Response) {
    let storage = Arc::clone(&self.storage);
    let diagnostics = Arc::clone(&self.diagnostics);
    let generation = self.dynamic.clone();

    self.tasks.spawn(async move {
      if let Err(e) = storage.put(&generation, &key, &response) {
        diagnostics.record("cache populate", &e);
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResponseSource, SqliteStorage};
  use crate::db::Database;
  use crate::net::RequestMode;
  use crate::testing::{key, ok_response, FailingStorage, MockNetwork};
  use url::Url;

  const DYNAMIC: &str = "app-dynamic-v1";

  struct Harness<S: CacheStorage> {
    layer: CacheLayer<S, MockNetwork>,
    storage: Arc<S>,
    network: Arc<MockNetwork>,
    tasks: Arc<BackgroundTasks>,
    diagnostics: Arc<Diagnostics>,
  }

  impl<S: CacheStorage> Harness<S> {
    fn new(storage: S) -> Self {
      let storage = Arc::new(storage);
      let network = Arc::new(MockNetwork::new());
      let diagnostics = Arc::new(Diagnostics::new());
      let tasks = Arc::new(BackgroundTasks::new(diagnostics.clone()));
      let fallback = Request::get(Url::parse("https://example.test/index.html").unwrap());
      let layer = CacheLayer::new(
        storage.clone(),
        network.clone(),
        DYNAMIC.to_string(),
        fallback,
        BTreeSet::new(),
        tasks.clone(),
        diagnostics.clone(),
      );
      Self {
        layer,
        storage,
        network,
        tasks,
        diagnostics,
      }
    }

    async fn settle(&self) {
      self.tasks.settle().await;
    }
  }

  fn sqlite() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap()).with_mode(RequestMode::SameOrigin)
  }

  #[tokio::test]
  async fn test_cache_hit_makes_no_network_call() {
    let h = Harness::new(sqlite());
    let stored = ok_response("https://example.test/app.js", "cached");
    h.storage
      .put("app-static-v1", &key("https://example.test/app.js"), &stored)
      .unwrap();
    h.network
      .respond_with("https://example.test/app.js", ok_response("https://example.test/app.js", "live"));

    let served = h.layer.respond(&get("https://example.test/app.js")).await.unwrap();

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response, stored);
    assert_eq!(h.network.calls(), 0);
  }

  #[tokio::test]
  async fn test_miss_populates_dynamic_generation() {
    let h = Harness::new(sqlite());
    let live = ok_response("https://example.test/data.json", "{}");
    h.network.respond_with("https://example.test/data.json", live.clone());

    let served = h
      .layer
      .respond(&get("https://example.test/data.json"))
      .await
      .unwrap();
    h.settle().await;

    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response, live);
    assert_eq!(h.network.calls(), 1);
    assert_eq!(h.storage.entry_count(DYNAMIC).unwrap(), 1);
    let entry = h
      .storage
      .lookup_in(DYNAMIC, &key("https://example.test/data.json"))
      .unwrap()
      .unwrap();
    assert_eq!(entry.response, live);
  }

  #[tokio::test]
  async fn test_second_request_is_served_from_cache() {
    let h = Harness::new(sqlite());
    h.network
      .respond_with("https://example.test/a.css", ok_response("https://example.test/a.css", "a"));

    h.layer.respond(&get("https://example.test/a.css")).await.unwrap();
    h.settle().await;
    let served = h.layer.respond(&get("https://example.test/a.css")).await.unwrap();

    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(h.network.calls(), 1);
  }

  #[tokio::test]
  async fn test_non_200_is_returned_but_not_cached() {
    let h = Harness::new(sqlite());
    let mut not_found = ok_response("https://example.test/missing", "nope");
    not_found.status = 404;
    h.network.respond_with("https://example.test/missing", not_found);

    let served = h
      .layer
      .respond(&get("https://example.test/missing"))
      .await
      .unwrap();
    h.settle().await;

    assert_eq!(served.response.status, 404);
    assert_eq!(h.storage.entry_count(DYNAMIC).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_opaque_response_is_not_cached() {
    let h = Harness::new(sqlite());
    let mut opaque = ok_response("https://cdn.other.test/lib.js", "");
    opaque.response_type = ResponseType::Opaque;
    h.network.respond_with("https://cdn.other.test/lib.js", opaque);

    let served = h
      .layer
      .respond(&Request::get(Url::parse("https://cdn.other.test/lib.js").unwrap()))
      .await
      .unwrap();
    h.settle().await;

    assert_eq!(served.response.response_type, ResponseType::Opaque);
    assert_eq!(h.storage.entry_count(DYNAMIC).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_fallback_document() {
    let h = Harness::new(sqlite());
    let shell = ok_response("https://example.test/index.html", "<html>shell</html>");
    h.storage
      .put("app-static-v1", &key("https://example.test/index.html"), &shell)
      .unwrap();
    h.network.go_offline();

    let request = Request::navigate(Url::parse("https://example.test/portfolio/42").unwrap());
    let served = h.layer.respond(&request).await.unwrap();

    assert_eq!(served.source, ResponseSource::OfflineFallback);
    assert_eq!(served.response, shell);
  }

  #[tokio::test]
  async fn test_offline_subresource_fails() {
    let h = Harness::new(sqlite());
    h.storage
      .put(
        "app-static-v1",
        &key("https://example.test/index.html"),
        &ok_response("https://example.test/index.html", "shell"),
      )
      .unwrap();
    h.network.go_offline();

    let result = h.layer.respond(&get("https://example.test/photo.png")).await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_offline_navigation_without_fallback_fails() {
    let h = Harness::new(sqlite());
    h.network.go_offline();

    let request = Request::navigate(Url::parse("https://example.test/").unwrap());
    assert!(h.layer.respond(&request).await.is_err());
  }

  #[tokio::test]
  async fn test_persist_failure_is_swallowed() {
    let h = Harness::new(FailingStorage::new(sqlite()).fail_puts());
    let live = ok_response("https://example.test/data.json", "{}");
    h.network.respond_with("https://example.test/data.json", live.clone());

    let served = h
      .layer
      .respond(&get("https://example.test/data.json"))
      .await
      .unwrap();
    h.settle().await;

    assert_eq!(served.response, live);
    let recent = h.diagnostics.recent();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].context, "cache populate");
  }

  #[tokio::test]
  async fn test_concurrent_misses_are_not_deduplicated() {
    let h = Harness::new(sqlite());
    h.network
      .respond_with("https://example.test/b.js", ok_response("https://example.test/b.js", "b"));

    let request = get("https://example.test/b.js");
    let (a, b) = tokio::join!(h.layer.respond(&request), h.layer.respond(&request));
    h.settle().await;

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.network.calls(), 2);
    assert_eq!(h.storage.entry_count(DYNAMIC).unwrap(), 1);
  }
}
