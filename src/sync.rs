//! Background sync: durable queue of actions attempted while offline.
//!
//! Tasks are replayed in FIFO order when a sync trigger fires. A failing task
//! stays queued for the next trigger without blocking the tasks behind it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::BoxFuture;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::net::{attempt_network, FetchFailure, Network, Request};

/// An action the user attempted while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
  /// Assigned by the store; zero until persisted
  pub id: i64,
  /// Logical queue name, e.g. "background-sync"
  pub tag: String,
  pub method: String,
  pub url: String,
  /// Request headers sent again on replay
  pub headers: Vec<(String, String)>,
  /// JSON view of the body; `Null` when the body is empty or not JSON
  pub payload: Value,
  /// Exact body bytes as the application sent them
  pub body: Option<Vec<u8>>,
  pub created_at: DateTime<Utc>,
}

/// Set by the transport for each connection; never replayed.
const TRANSPORT_HEADERS: [&str; 5] = [
  "host",
  "content-length",
  "connection",
  "transfer-encoding",
  "keep-alive",
];

impl SyncTask {
  pub fn new(tag: &str, method: &Method, url: &Url, payload: Value) -> Self {
    Self {
      id: 0,
      tag: tag.to_string(),
      method: method.as_str().to_string(),
      url: url.to_string(),
      headers: Vec::new(),
      payload,
      body: None,
      created_at: Utc::now(),
    }
  }

  /// Capture a request that could not be delivered. The body and headers are
  /// kept byte for byte so the replay matches the original request.
  pub fn from_request(tag: &str, request: &Request) -> Self {
    let payload = request
      .body
      .as_deref()
      .and_then(|body| serde_json::from_slice(body).ok())
      .unwrap_or(Value::Null);

    let mut task = Self::new(tag, &request.method, &request.url, payload);
    task.headers = request
      .headers
      .iter()
      .filter(|(name, _)| {
        !TRANSPORT_HEADERS
          .iter()
          .any(|skip| name.eq_ignore_ascii_case(skip))
      })
      .cloned()
      .collect();
    task.body = request.body.clone();
    task
  }

  /// Rebuild the request to send on replay.
  pub fn to_request(&self) -> Result<Request, SyncError> {
    let method = Method::from_bytes(self.method.as_bytes()).map_err(|e| SyncError::Invalid {
      id: self.id,
      reason: e.to_string(),
    })?;
    let url = Url::parse(&self.url).map_err(|e| SyncError::Invalid {
      id: self.id,
      reason: e.to_string(),
    })?;

    let mut request = Request::new(method, url);
    request.headers = self.headers.clone();
    match (&self.body, &self.payload) {
      (Some(body), _) => request.body = Some(body.clone()),
      (None, Value::Null) => {}
      (None, payload) => request = request.with_json(payload),
    }
    Ok(request)
  }
}

/// Why a single replay did not go through.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error(transparent)]
  Network(#[from] FetchFailure),
  #[error("server rejected replay with HTTP {0}")]
  Rejected(u16),
  #[error("invalid sync task {id}: {reason}")]
  Invalid { id: i64, reason: String },
}

/// Durable storage for queued tasks.
pub trait SyncTaskStore: Send + Sync {
  /// Append a task, returning its assigned id.
  fn push(&self, task: &SyncTask) -> Result<i64>;

  /// Tasks for a tag in insertion order.
  fn list(&self, tag: &str) -> Result<Vec<SyncTask>>;

  fn remove(&self, id: i64) -> Result<()>;

  /// Delete the tasks for a tag with an id up to and including `through`.
  /// Tasks queued later are kept.
  fn clear(&self, tag: &str, through: i64) -> Result<()>;
}

/// Delivers a queued task to its destination.
pub trait SyncTaskReplayer: Send + Sync {
  fn replay<'a>(&'a self, task: &'a SyncTask) -> BoxFuture<'a, Result<(), SyncError>>;
}

/// Replays tasks by re-sending the captured request over the network.
pub struct NetworkReplayer {
  network: Arc<dyn Network>,
  timeout: Duration,
}

impl NetworkReplayer {
  pub fn new(network: Arc<dyn Network>, timeout: Duration) -> Self {
    Self { network, timeout }
  }
}

impl SyncTaskReplayer for NetworkReplayer {
  fn replay<'a>(&'a self, task: &'a SyncTask) -> BoxFuture<'a, Result<(), SyncError>> {
    Box::pin(async move {
      let request = task.to_request()?;
      let response = attempt_network(self.network.as_ref(), &request, self.timeout).await?;
      if response.is_success() {
        Ok(())
      } else {
        Err(SyncError::Rejected(response.status))
      }
    })
  }
}

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
  pub attempted: usize,
  pub replayed: usize,
  pub remaining: usize,
}

pub struct SyncQueue<S> {
  store: Arc<S>,
  replayer: Arc<dyn SyncTaskReplayer>,
}

impl<S: SyncTaskStore> SyncQueue<S> {
  pub fn new(store: Arc<S>, replayer: Arc<dyn SyncTaskReplayer>) -> Self {
    Self { store, replayer }
  }

  pub fn enqueue(&self, task: &SyncTask) -> Result<i64> {
    let id = self.store.push(task)?;
    info!(id, tag = %task.tag, url = %task.url, "queued action for background sync");
    Ok(id)
  }

  pub fn pending(&self, tag: &str) -> Result<Vec<SyncTask>> {
    self.store.list(tag)
  }

  /// Replay every queued task for `tag` once, strictly in order.
  pub async fn drain(&self, tag: &str) -> Result<SyncReport> {
    let tasks = self.store.list(tag)?;
    if tasks.is_empty() {
      debug!(tag, "sync queue empty");
      return Ok(SyncReport::default());
    }

    let mut report = SyncReport::default();
    for task in &tasks {
      report.attempted += 1;
      match self.replayer.replay(task).await {
        Ok(()) => match self.store.remove(task.id) {
          Ok(()) => report.replayed += 1,
          Err(e) => {
            warn!(id = task.id, error = %e, "replayed task could not be removed");
            report.remaining += 1;
          }
        },
        Err(e) => {
          warn!(id = task.id, tag, error = %e, "sync replay failed, keeping task");
          report.remaining += 1;
        }
      }
    }

    // Only what this pass listed; a task queued mid-pass waits for the next one
    if report.remaining == 0 {
      if let Some(last) = tasks.last() {
        self.store.clear(tag, last.id)?;
      }
    }

    info!(
      tag,
      attempted = report.attempted,
      replayed = report.replayed,
      remaining = report.remaining,
      "sync pass finished"
    );
    Ok(report)
  }
}
