//! Request filter deciding whether the worker intercepts a request at all.

use reqwest::Method;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
  Intercept,
  /// Not a read; goes straight to the network
  RejectMethod,
  /// Extension or other internal scheme; goes straight to the network
  RejectScheme,
}

impl Verdict {
  pub fn is_intercepted(self) -> bool {
    self == Verdict::Intercept
  }
}

/// Only GETs over http(s) are intercepted. Pure, no side effects.
pub fn classify(method: &Method, url: &Url) -> Verdict {
  if *method != Method::GET {
    return Verdict::RejectMethod;
  }

  match url.scheme() {
    "http" | "https" => Verdict::Intercept,
    _ => Verdict::RejectScheme,
  }
}
