//! Test doubles shared by the unit tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::cache::{CacheStorage, CachedEntry, RequestKey};
use crate::config::Config;
use crate::net::{Network, Request, Response, ResponseType};
use crate::notify::{Notification, Notifier};

pub fn test_config() -> Config {
  Config::from_yaml("app: app\ndisplay_name: BuildFolio\norigin: https://example.test\n")
    .expect("test config")
}

pub fn key(url: &str) -> RequestKey {
  RequestKey::from_request(&Request::get(Url::parse(url).unwrap()), &BTreeSet::new())
}

pub fn ok_response(url: &str, body: &str) -> Response {
  Response {
    url: Url::parse(url).unwrap(),
    status: 200,
    headers: vec![("content-type".to_string(), "text/plain".to_string())],
    body: body.as_bytes().to_vec(),
    response_type: ResponseType::Basic,
  }
}

/// Scripted network. Unknown URLs get a 404.
#[derive(Default)]
pub struct MockNetwork {
  routes: Mutex<HashMap<String, Response>>,
  failing: Mutex<HashSet<String>>,
  failing_bodies: Mutex<Vec<String>>,
  offline: AtomicBool,
  calls: AtomicUsize,
  latency: Option<Duration>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every answer arrives after `latency`, letting other tasks interleave.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = Some(latency);
    self
  }

  pub fn respond_with(&self, url: &str, response: Response) {
    self.routes.lock().unwrap().insert(url.to_string(), response);
  }

  /// Transport failure for one URL
  pub fn fail(&self, url: &str) {
    self.failing.lock().unwrap().insert(url.to_string());
  }

  /// Transport failure for requests whose body contains `needle`
  pub fn fail_body_containing(&self, needle: &str) {
    self.failing_bodies.lock().unwrap().push(needle.to_string());
  }

  pub fn go_offline(&self) {
    self.offline.store(true, Ordering::SeqCst);
  }

  pub fn go_online(&self) {
    self.offline.store(false, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn answer(&self, request: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let url = request.url.as_str();

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable"));
    }
    if self.failing.lock().unwrap().contains(url) {
      return Err(eyre!("connection reset fetching {}", url));
    }
    if let Some(body) = &request.body {
      let body = String::from_utf8_lossy(body);
      if self
        .failing_bodies
        .lock()
        .unwrap()
        .iter()
        .any(|needle| body.contains(needle.as_str()))
      {
        return Err(eyre!("connection reset posting to {}", url));
      }
    }

    let routed = self.routes.lock().unwrap().get(url).cloned();
    Ok(routed.unwrap_or_else(|| {
      let mut missing = ok_response(url, "not found");
      missing.status = 404;
      missing
    }))
  }
}

impl Network for MockNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let result = self.answer(request);
    let latency = self.latency;
    async move {
      if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
      }
      result
    }
  }
}

/// Storage wrapper that injects write/delete failures.
pub struct FailingStorage<S: CacheStorage> {
  inner: S,
  fail_puts: bool,
  fail_delete: Option<String>,
}

impl<S: CacheStorage> FailingStorage<S> {
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      fail_puts: false,
      fail_delete: None,
    }
  }

  pub fn fail_puts(mut self) -> Self {
    self.fail_puts = true;
    self
  }

  pub fn fail_delete_of(mut self, generation: &str) -> Self {
    self.fail_delete = Some(generation.to_string());
    self
  }
}

impl<S: CacheStorage> CacheStorage for FailingStorage<S> {
  fn open(&self, generation: &str) -> Result<()> {
    self.inner.open(generation)
  }

  fn generations(&self) -> Result<Vec<String>> {
    self.inner.generations()
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    if self.fail_delete.as_deref() == Some(generation) {
      return Err(eyre!("disk I/O error deleting {}", generation));
    }
    self.inner.delete_generation(generation)
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    if self.fail_puts {
      return Err(eyre!("quota exceeded"));
    }
    self.inner.put(generation, key, response)
  }

  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    if self.fail_puts {
      return Err(eyre!("quota exceeded"));
    }
    self.inner.put_all(generation, entries)
  }

  fn lookup(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.inner.lookup(key)
  }

  fn lookup_in(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.inner.lookup_in(generation, key)
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    self.inner.entry_count(generation)
  }
}

#[derive(Default)]
pub struct RecordingNotifier {
  shown: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
  pub fn shown(&self) -> Vec<Notification> {
    self.shown.lock().unwrap().clone()
  }
}

impl Notifier for RecordingNotifier {
  fn show(&self, notification: &Notification) -> Result<()> {
    self.shown.lock().unwrap().push(notification.clone());
    Ok(())
  }
}
