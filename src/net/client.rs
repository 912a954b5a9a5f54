use color_eyre::{eyre::eyre, Result};
use reqwest::Client;
use std::future::Future;
use url::{Origin, Url};

use crate::config::Config;

use super::{Network, Request, RequestMode, Response, ResponseType};

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpNetwork {
  client: Client,
  origin: Origin,
}

impl HttpNetwork {
  pub fn new(config: &Config) -> Result<Self> {
    let client = Client::builder()
      .user_agent(concat!("offline-shell/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: config.origin_url()?.origin(),
    })
  }

  fn classify(&self, request: &Request, final_url: &Url) -> ResponseType {
    if request.url.origin() == self.origin && final_url.origin() == self.origin {
      ResponseType::Basic
    } else if request.mode == RequestMode::NoCors {
      ResponseType::Opaque
    } else {
      ResponseType::Cors
    }
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    async move {
      let mut builder = self
        .client
        .request(request.method.clone(), request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("{} {} failed: {}", request.method, request.url, e))?;

      let final_url = response.url().clone();
      let response_type = self.classify(request, &final_url);

      if response_type == ResponseType::Opaque {
        return Ok(Response {
          url: final_url,
          status: 0,
          headers: Vec::new(),
          body: Vec::new(),
          response_type,
        });
      }

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", final_url, e))?
        .to_vec();

      Ok(Response {
        url: final_url,
        status,
        headers,
        body,
        response_type,
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn network() -> HttpNetwork {
    let config = Config::from_yaml("app: a\norigin: https://example.test\n").unwrap();
    HttpNetwork::new(&config).unwrap()
  }

  #[test]
  fn test_same_origin_is_basic() {
    let net = network();
    let url = Url::parse("https://example.test/app.js").unwrap();
    let request = Request::get(url.clone());
    assert_eq!(net.classify(&request, &url), ResponseType::Basic);
  }

  #[test]
  fn test_cross_origin_no_cors_is_opaque() {
    let net = network();
    let url = Url::parse("https://cdn.other.test/font.woff2").unwrap();
    let request = Request::get(url.clone());
    assert_eq!(net.classify(&request, &url), ResponseType::Opaque);
  }

  #[test]
  fn test_cross_origin_cors_mode_is_cors() {
    let net = network();
    let url = Url::parse("https://api.other.test/data").unwrap();
    let request = Request::get(url.clone()).with_mode(RequestMode::Cors);
    assert_eq!(net.classify(&request, &url), ResponseType::Cors);
  }

  #[test]
  fn test_redirect_off_origin_is_not_basic() {
    let net = network();
    let request = Request::get(Url::parse("https://example.test/go").unwrap())
      .with_mode(RequestMode::Cors);
    let landed = Url::parse("https://elsewhere.test/").unwrap();
    assert_eq!(net.classify(&request, &landed), ResponseType::Cors);
  }
}
