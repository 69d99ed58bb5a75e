//! Request and response values exchanged with the network and the cache.

use std::borrow::Cow;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Why a network exchange produced no response at all.
///
/// An HTTP error status is still a response; only transport-level problems
/// are failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
  /// Offline, DNS failure, connection reset, ...
  #[error("network unavailable: {0}")]
  Transport(String),
  #[error("network timed out after {0:?}")]
  Timeout(Duration),
}

/// An outgoing request as issued by the application.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Attach a JSON body and the matching content type.
  pub fn with_json(self, body: &Value) -> Self {
    let mut request = self.with_header("content-type", "application/json");
    request.body = Some(body.to_string().into_bytes());
    request
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Whether the caller is navigating to an HTML document.
  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .is_some_and(|accept| accept.contains("text/html"))
  }
}

/// A complete response with its body fully buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: Vec<u8>) -> Self {
    let status_text = StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or_default()
      .to_string();

    Self {
      status,
      status_text,
      headers: Vec::new(),
      body,
    }
  }

  pub fn text(status: u16, body: &str) -> Self {
    Self::new(status, body.as_bytes().to_vec()).with_header("content-type", "text/plain")
  }

  pub fn json(status: u16, body: &Value) -> Self {
    Self::new(status, body.to_string().into_bytes())
      .with_header("content-type", "application/json")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// 2xx statuses; the only responses that may be cached.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body_text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}
