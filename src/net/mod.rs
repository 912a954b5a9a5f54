//! Request/response model and the network transport seam.

mod client;

pub use client::HttpNetwork;

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::future::Future;
use url::Url;

/// How the request was initiated by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document navigation
  Navigate,
  SameOrigin,
  Cors,
  NoCors,
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::NoCors,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// JSON POST to a same-origin endpoint.
  pub fn post_json(url: Url, payload: &serde_json::Value) -> Result<Self> {
    let body =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    Ok(Self {
      method: Method::POST,
      url,
      mode: RequestMode::SameOrigin,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: Some(body),
    })
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Response tainting as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
  /// Same-origin response with full access to status, headers and body
  Basic,
  /// Cross-origin response allowed by CORS
  Cors,
  /// Cross-origin `no-cors` response; status, headers and body are hidden
  Opaque,
}

impl ResponseType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "opaque" => Some(Self::Opaque),
      _ => None,
    }
  }
}

/// Fully buffered response. Cloning it is how the pipeline hands one copy to
/// the caller and another to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub url: Url,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub response_type: ResponseType,
}

impl Response {
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Transport used for every outbound request.
///
/// `Err` means no response could be obtained at all (offline, DNS, timeout);
/// HTTP error statuses come back as `Ok`.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}
