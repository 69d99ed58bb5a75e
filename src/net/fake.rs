//! In-memory network used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Method;

use super::{FetchFailure, Network, Request, Response};

/// Serves canned responses by URL and records every call.
///
/// Unknown URLs fail like a refused connection.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  delay: Option<Duration>,
  calls: Mutex<Vec<(Method, String)>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(self, url: &str, response: Response) -> Self {
    self.set_route(url, response);
    self
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn set_route(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<(Method, String)> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl Network for FakeNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchFailure>> {
    Box::pin(async move {
      self
        .calls
        .lock()
        .unwrap()
        .push((request.method.clone(), request.url.to_string()));

      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }

      if self.offline.load(Ordering::SeqCst) {
        return Err(FetchFailure::Transport("offline".to_string()));
      }

      self
        .routes
        .lock()
        .unwrap()
        .get(request.url.as_str())
        .cloned()
        .ok_or_else(|| FetchFailure::Transport("connection refused".to_string()))
    })
  }
}
