//! The cache coordinator: one object wiring the fetch interceptor, the
//! lifecycle manager, the sync queue and the notification dispatcher together,
//! and implementing every worker event handler on top of them.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::Method;
use tracing::{info, warn};
use url::Url;

use crate::cache::{
  CacheStorage, FetchDecision, FetchInterceptor, GenerationInfo, SqliteStorage,
};
use crate::lifecycle::{
  GenerationPair, InstallError, InstallOutcome, LifecycleEvent, LifecycleManager, LifecycleState,
  StateStore,
};
use crate::net::{attempt_network, FetchFailure, Network, Request, Response};
use crate::notify::{ClickOutcome, Notification, NotificationDispatcher};
use crate::sync::{SyncQueue, SyncReport, SyncTask, SyncTaskReplayer, SyncTaskStore};
use crate::worker::{WorkerLifecycle, WorkerMessage};

/// Everything the coordinator needs to know about the deployed application.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
  pub origin: Url,
  /// Same-origin path prefix served network-first
  pub api_prefix: String,
  pub static_cache_name: String,
  pub dynamic_cache_name: String,
  /// Assets that must all be fetched before a generation may activate
  pub asset_manifest: Vec<Url>,
  pub offline_page: Url,
  pub network_first_timeout: Duration,
  pub cache_first_timeout: Duration,
  pub sync_tag: String,
}

impl CoordinatorConfig {
  pub fn generation_pair(&self) -> GenerationPair {
    GenerationPair {
      static_name: self.static_cache_name.clone(),
      dynamic_name: self.dynamic_cache_name.clone(),
    }
  }
}

/// Storage able to back every part of the coordinator.
pub trait WorkerStorage: CacheStorage + SyncTaskStore + StateStore + 'static {}

impl<T: CacheStorage + SyncTaskStore + StateStore + 'static> WorkerStorage for T {}

/// What happened to an application action.
#[derive(Debug)]
pub enum ActionOutcome {
  Sent(Response),
  /// The network was unreachable; the action waits in the sync queue
  Queued(i64),
}

pub struct CacheCoordinator<S = SqliteStorage> {
  config: CoordinatorConfig,
  storage: Arc<S>,
  network: Arc<dyn Network>,
  interceptor: FetchInterceptor<S>,
  lifecycle: LifecycleManager<S>,
  sync: SyncQueue<S>,
  dispatcher: Arc<NotificationDispatcher>,
}

impl<S: WorkerStorage> CacheCoordinator<S> {
  pub fn new(
    config: CoordinatorConfig,
    storage: Arc<S>,
    network: Arc<dyn Network>,
    replayer: Arc<dyn SyncTaskReplayer>,
    dispatcher: Arc<NotificationDispatcher>,
  ) -> Result<Self> {
    let interceptor =
      FetchInterceptor::new(Arc::clone(&storage), Arc::clone(&network), config.clone());
    let lifecycle = LifecycleManager::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      config.generation_pair(),
      config.asset_manifest.clone(),
      config.network_first_timeout,
    )?;
    let sync = SyncQueue::new(Arc::clone(&storage), replayer);

    if lifecycle.state() == Some(LifecycleState::InstalledWaiting) {
      dispatcher.notify_update_available();
    }

    Ok(Self {
      config,
      storage,
      network,
      interceptor,
      lifecycle,
      sync,
      dispatcher,
    })
  }

  pub fn lifecycle(&self) -> &LifecycleManager<S> {
    &self.lifecycle
  }

  pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
    &self.dispatcher
  }

  pub fn lifecycle_events(&self) -> tokio::sync::broadcast::Sender<LifecycleEvent> {
    self.lifecycle.sender()
  }

  /// Fetch on behalf of the application. GET requests go through the
  /// interceptor; everything else goes straight to the network.
  pub async fn fetch(&self, request: &Request) -> Result<Response, FetchFailure> {
    match self.interceptor.handle(request).await {
      FetchDecision::Respond(result) => Ok(result.data),
      FetchDecision::Passthrough => {
        attempt_network(
          self.network.as_ref(),
          request,
          self.config.network_first_timeout,
        )
        .await
      }
    }
  }

  /// Send a state-changing action, queueing it for background sync when the
  /// network cannot be reached.
  pub async fn send_action(&self, request: Request) -> Result<ActionOutcome> {
    match self.fetch(&request).await {
      Ok(response) => Ok(ActionOutcome::Sent(response)),
      Err(failure) if request.method != Method::GET => {
        info!(url = %request.url, %failure, "action failed, queueing for sync");
        let task = SyncTask::from_request(&self.config.sync_tag, &request);
        Ok(ActionOutcome::Queued(self.sync.enqueue(&task)?))
      }
      Err(failure) => Err(eyre!("Request to {} failed: {}", request.url, failure)),
    }
  }

  pub fn generations(&self) -> Result<Vec<GenerationInfo>> {
    self
      .storage
      .keys()?
      .into_iter()
      .map(|name| -> Result<GenerationInfo> {
        let entries = self.storage.entry_count(&name)?;
        Ok(GenerationInfo { name, entries })
      })
      .collect()
  }

  pub fn pending_sync(&self) -> Result<usize> {
    Ok(self.sync.pending(&self.config.sync_tag)?.len())
  }
}

impl<S: WorkerStorage> WorkerLifecycle for CacheCoordinator<S> {
  fn on_install(&self) -> BoxFuture<'_, Result<InstallOutcome, InstallError>> {
    Box::pin(async move {
      let outcome = self.lifecycle.install().await?;
      if outcome == InstallOutcome::Waiting {
        self.dispatcher.notify_update_available();
      }
      Ok(outcome)
    })
  }

  fn on_activate(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
      self.lifecycle.activate()?;
      self.dispatcher.clear_update();
      Ok(())
    })
  }

  fn on_fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, FetchFailure>> {
    Box::pin(async move { self.fetch(&request).await })
  }

  fn on_sync(&self, tag: String) -> BoxFuture<'_, Result<SyncReport>> {
    Box::pin(async move { self.sync.drain(&tag).await })
  }

  fn on_push(&self, payload: Vec<u8>) -> BoxFuture<'_, Notification> {
    Box::pin(async move { self.dispatcher.notify_push(&payload) })
  }

  fn on_message(&self, message: WorkerMessage) -> BoxFuture<'_, ()> {
    Box::pin(async move {
      match message {
        WorkerMessage::SkipWaiting => match self.lifecycle.skip_waiting() {
          Ok(()) => self.dispatcher.clear_update(),
          Err(e) => warn!(error = %e, "skip waiting failed"),
        },
      }
    })
  }

  fn on_notification_click(
    &self,
    notification: Notification,
    action: Option<String>,
  ) -> BoxFuture<'_, ClickOutcome> {
    Box::pin(async move {
      self
        .dispatcher
        .handle_click(&notification, action.as_deref())
    })
  }
}
