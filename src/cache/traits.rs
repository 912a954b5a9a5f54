//! Core types for the cache store.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::net::{Request, Response};

/// Which region of the cache a generation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationKind {
  /// Fixed manifest, replaced wholesale on deploy
  Static,
  /// Grows opportunistically at runtime
  Dynamic,
}

impl GenerationKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
    }
  }
}

/// A named, versioned partition of the cache store: `{app}-{kind}-v{version}`.
///
/// Identity is the name only. Any stored generation whose name differs from
/// the current static/dynamic pair is stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Generation {
  pub app: String,
  pub kind: GenerationKind,
  pub version: u32,
}

impl Generation {
  pub fn static_for(app: &str, version: u32) -> Self {
    Self {
      app: app.to_string(),
      kind: GenerationKind::Static,
      version,
    }
  }

  pub fn dynamic_for(app: &str, version: u32) -> Self {
    Self {
      app: app.to_string(),
      kind: GenerationKind::Dynamic,
      version,
    }
  }

  pub fn name(&self) -> String {
    format!("{}-{}-v{}", self.app, self.kind.as_str(), self.version)
  }
}

impl fmt::Display for Generation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name())
  }
}

/// Normalized request descriptor used as the cache key.
///
/// Method is upper-cased, the URL loses its fragment, and only the configured
/// vary headers are kept (lower-cased names, sorted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
  pub vary: Vec<(String, String)>,
}

impl RequestKey {
  pub fn from_request(request: &Request, vary_headers: &BTreeSet<String>) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);

    let vary = vary_headers
      .iter()
      .filter_map(|name| {
        request
          .header(name)
          .map(|value| (name.clone(), value.trim().to_string()))
      })
      .collect();

    Self {
      method: request.method.as_str().to_uppercase(),
      url: url.to_string(),
      vary,
    }
  }

  /// Human-readable form, also the hash input.
  pub fn description(&self) -> String {
    let mut out = format!("{} {}", self.method, self.url);
    for (name, value) in &self.vary {
      out.push_str(&format!("\n{}: {}", name, value));
    }
    out
  }

  /// SHA256 hash for stable, fixed-length keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  pub generation: String,
  pub cached_at: DateTime<Utc>,
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Stored snapshot, no network call made
  Cache,
  /// Live network response
  Network,
  /// Network unreachable, navigation answered with the fallback document
  OfflineFallback,
}

/// Response handed back to the client, with metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
}

impl Served {
  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
    }
  }

  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn offline(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::OfflineFallback,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;

  fn request(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_fragment_does_not_change_key() {
    let none = BTreeSet::new();
    let a = RequestKey::from_request(&request("https://example.test/page"), &none);
    let b = RequestKey::from_request(&request("https://example.test/page#section"), &none);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_query_string_changes_key() {
    let none = BTreeSet::new();
    let a = RequestKey::from_request(&request("https://example.test/page?a=1"), &none);
    let b = RequestKey::from_request(&request("https://example.test/page?a=2"), &none);
    assert_ne!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_only_vary_headers_participate() {
    let vary: BTreeSet<String> = ["accept-language".to_string()].into_iter().collect();
    let en = request("https://example.test/").with_header("Accept-Language", "en");
    let de = request("https://example.test/").with_header("Accept-Language", "de");
    let en_with_cookie = request("https://example.test/")
      .with_header("Accept-Language", "en")
      .with_header("Cookie", "x=1");

    let key_en = RequestKey::from_request(&en, &vary);
    assert_ne!(key_en, RequestKey::from_request(&de, &vary));
    assert_eq!(key_en, RequestKey::from_request(&en_with_cookie, &vary));
  }

  #[test]
  fn test_method_is_part_of_key() {
    let none = BTreeSet::new();
    let get = request("https://example.test/");
    let mut head = get.clone();
    head.method = Method::HEAD;
    assert_ne!(
      RequestKey::from_request(&get, &none).cache_hash(),
      RequestKey::from_request(&head, &none).cache_hash()
    );
  }

  #[test]
  fn test_hash_is_hex_sha256() {
    let key = RequestKey::from_request(&request("https://example.test/"), &BTreeSet::new());
    let hash = key.cache_hash();
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
