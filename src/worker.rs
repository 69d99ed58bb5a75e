//! Event-driven worker runtime.
//!
//! Events are posted to a channel and routed through a dispatch table keyed by
//! [`EventKind`]. Every handler runs as its own task in a `JoinSet`, so the
//! runtime stays alive until all in-flight handlers have finished, even after
//! shutdown has been requested.

use std::collections::HashMap;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::lifecycle::{InstallError, InstallOutcome, LifecycleEvent};
use crate::net::{FetchFailure, Request, Response};
use crate::notify::{ClickOutcome, Notification};
use crate::sync::SyncReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
  Sync,
  Push,
  Message,
  NotificationClick,
}

impl EventKind {
  pub const ALL: [EventKind; 7] = [
    EventKind::Install,
    EventKind::Activate,
    EventKind::Fetch,
    EventKind::Sync,
    EventKind::Push,
    EventKind::Message,
    EventKind::NotificationClick,
  ];
}

/// Messages a client may post to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  SkipWaiting,
}

impl WorkerMessage {
  pub fn from_json(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| eyre!("Unrecognised worker message {}: {}", raw, e))
  }
}

/// Where a handler sends its result, if anyone is waiting for it.
pub type Reply<T> = Option<oneshot::Sender<T>>;

pub enum WorkerEvent {
  Install(Reply<Result<InstallOutcome, InstallError>>),
  Activate(Reply<Result<()>>),
  Fetch(Request, Reply<Result<Response, FetchFailure>>),
  Sync(String, Reply<Result<SyncReport>>),
  Push(Vec<u8>, Reply<Notification>),
  Message(WorkerMessage),
  NotificationClick(Notification, Option<String>, Reply<ClickOutcome>),
}

impl WorkerEvent {
  pub fn kind(&self) -> EventKind {
    match self {
      WorkerEvent::Install(_) => EventKind::Install,
      WorkerEvent::Activate(_) => EventKind::Activate,
      WorkerEvent::Fetch(..) => EventKind::Fetch,
      WorkerEvent::Sync(..) => EventKind::Sync,
      WorkerEvent::Push(..) => EventKind::Push,
      WorkerEvent::Message(_) => EventKind::Message,
      WorkerEvent::NotificationClick(..) => EventKind::NotificationClick,
    }
  }
}

/// Handlers for every event the worker reacts to.
pub trait WorkerLifecycle: Send + Sync {
  fn on_install(&self) -> BoxFuture<'_, Result<InstallOutcome, InstallError>>;
  fn on_activate(&self) -> BoxFuture<'_, Result<()>>;
  fn on_fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, FetchFailure>>;
  fn on_sync(&self, tag: String) -> BoxFuture<'_, Result<SyncReport>>;
  fn on_push(&self, payload: Vec<u8>) -> BoxFuture<'_, Notification>;
  fn on_message(&self, message: WorkerMessage) -> BoxFuture<'_, ()>;
  fn on_notification_click(
    &self,
    notification: Notification,
    action: Option<String>,
  ) -> BoxFuture<'_, ClickOutcome>;
}

#[derive(Default, Clone)]
pub struct DispatchTable {
  handlers: HashMap<EventKind, Arc<dyn WorkerLifecycle>>,
}

impl DispatchTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Route every event kind to `handler`.
  pub fn register<H: WorkerLifecycle + 'static>(mut self, handler: Arc<H>) -> Self {
    let handler: Arc<dyn WorkerLifecycle> = handler;
    for kind in EventKind::ALL {
      self.handlers.insert(kind, Arc::clone(&handler));
    }
    self
  }

  pub fn get(&self, kind: EventKind) -> Option<Arc<dyn WorkerLifecycle>> {
    self.handlers.get(&kind).cloned()
  }
}

fn respond<T>(reply: Reply<T>, value: T) {
  if let Some(reply) = reply {
    // The requester may have given up waiting
    let _ = reply.send(value);
  }
}

async fn run_handler(handler: Arc<dyn WorkerLifecycle>, event: WorkerEvent) {
  match event {
    WorkerEvent::Install(reply) => {
      let result = handler.on_install().await;
      if let Err(e) = &result {
        warn!(error = %e, "install handler failed");
      }
      respond(reply, result);
    }
    WorkerEvent::Activate(reply) => {
      let result = handler.on_activate().await;
      if let Err(e) = &result {
        warn!(error = %e, "activate handler failed");
      }
      respond(reply, result);
    }
    WorkerEvent::Fetch(request, reply) => {
      let result = handler.on_fetch(request).await;
      respond(reply, result);
    }
    WorkerEvent::Sync(tag, reply) => {
      let result = handler.on_sync(tag).await;
      if let Err(e) = &result {
        warn!(error = %e, "sync handler failed");
      }
      respond(reply, result);
    }
    WorkerEvent::Push(payload, reply) => {
      let notification = handler.on_push(payload).await;
      respond(reply, notification);
    }
    WorkerEvent::Message(message) => handler.on_message(message).await,
    WorkerEvent::NotificationClick(notification, action, reply) => {
      let outcome = handler.on_notification_click(notification, action).await;
      respond(reply, outcome);
    }
  }
}

pub struct WorkerRuntime;

impl WorkerRuntime {
  /// Start the event loop. Events posted through the returned handle are
  /// dispatched until the guard is shut down or dropped.
  pub fn spawn(
    table: DispatchTable,
    lifecycle: broadcast::Sender<LifecycleEvent>,
  ) -> (WorkerHandle, RuntimeGuard) {
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
      let mut in_flight = JoinSet::new();

      loop {
        tokio::select! {
          // Events already posted are dispatched before a shutdown request
          biased;
          Some(event) = rx.recv() => {
            let kind = event.kind();
            match table.get(kind) {
              Some(handler) => {
                in_flight.spawn(run_handler(handler, event));
              }
              None => debug!(?kind, "no handler registered, dropping event"),
            }
          }
          Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
            if let Err(e) = done {
              error!(error = %e, "worker handler panicked");
            }
          }
          _ = &mut shutdown_rx => break,
        }
      }

      // Keep alive until every handler that was started has finished
      while let Some(done) = in_flight.join_next().await {
        if let Err(e) = done {
          error!(error = %e, "worker handler panicked");
        }
      }
      debug!("worker runtime stopped");
    });

    (
      WorkerHandle { tx, lifecycle },
      RuntimeGuard {
        shutdown: Some(shutdown_tx),
        task,
      },
    )
  }
}

/// Owns the runtime task. Dropping it stops intake of new events.
pub struct RuntimeGuard {
  shutdown: Option<oneshot::Sender<()>>,
  task: JoinHandle<()>,
}

impl RuntimeGuard {
  /// Stop accepting events and wait for in-flight handlers.
  pub async fn shutdown(mut self) -> Result<()> {
    if let Some(shutdown) = self.shutdown.take() {
      let _ = shutdown.send(());
    }
    (&mut self.task)
      .await
      .map_err(|e| eyre!("Worker runtime failed: {}", e))
  }
}

/// Cloneable entry point used by clients to talk to the worker.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl WorkerHandle {
  pub fn post(&self, event: WorkerEvent) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Worker runtime has stopped"))
  }

  /// Post an event and wait for the handler's reply.
  pub async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> WorkerEvent) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    self.post(build(Some(tx)))?;
    rx.await
      .map_err(|_| eyre!("Worker dropped the request without replying"))
  }

  pub async fn install(&self) -> Result<InstallOutcome> {
    Ok(self.request(WorkerEvent::Install).await??)
  }

  pub async fn activate(&self) -> Result<()> {
    self.request(WorkerEvent::Activate).await?
  }

  pub async fn fetch(&self, request: Request) -> Result<Response> {
    let response = self
      .request(|reply| WorkerEvent::Fetch(request, reply))
      .await??;
    Ok(response)
  }

  pub async fn sync(&self, tag: &str) -> Result<SyncReport> {
    let tag = tag.to_string();
    self.request(|reply| WorkerEvent::Sync(tag, reply)).await?
  }

  pub async fn push(&self, payload: Vec<u8>) -> Result<Notification> {
    self.request(|reply| WorkerEvent::Push(payload, reply)).await
  }

  pub fn message(&self, message: WorkerMessage) -> Result<()> {
    self.post(WorkerEvent::Message(message))
  }

  pub async fn notification_click(
    &self,
    notification: Notification,
    action: Option<String>,
  ) -> Result<ClickOutcome> {
    self
      .request(|reply| WorkerEvent::NotificationClick(notification, action, reply))
      .await
  }

  pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
    self.lifecycle.subscribe()
  }
}
