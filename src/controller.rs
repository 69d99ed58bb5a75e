//! Client-side surface consumed by the UI: connectivity, install and update
//! state, and notification permission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::lifecycle::{LifecycleEvent, StateStore};
use crate::notify::{Notification, NotificationDispatcher, NotificationOptions};
use crate::worker::{WorkerEvent, WorkerHandle, WorkerMessage};

const INSTALLED_KEY: &str = "installed";
const UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallChoice {
  Accepted,
  Dismissed,
}

/// A deferred installation prompt; shown at most once.
pub trait InstallPrompt: Send + Sync {
  fn prompt(&self) -> BoxFuture<'_, InstallChoice>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
  /// Not asked yet
  Default,
  Granted,
  Denied,
}

pub trait PermissionProvider: Send + Sync {
  fn request(&self) -> BoxFuture<'_, Permission>;
}

/// Answers every permission request the same way.
pub struct StaticPermission(pub Permission);

impl PermissionProvider for StaticPermission {
  fn request(&self) -> BoxFuture<'_, Permission> {
    let permission = self.0;
    Box::pin(async move { permission })
  }
}

pub struct ClientController {
  worker: WorkerHandle,
  state: Arc<dyn StateStore>,
  dispatcher: Arc<NotificationDispatcher>,
  updates: watch::Receiver<bool>,
  online: AtomicBool,
  deferred_prompt: Mutex<Option<Box<dyn InstallPrompt>>>,
  permissions: Arc<dyn PermissionProvider>,
  permission: Mutex<Permission>,
}

impl ClientController {
  pub fn new(
    worker: WorkerHandle,
    state: Arc<dyn StateStore>,
    dispatcher: Arc<NotificationDispatcher>,
    permissions: Arc<dyn PermissionProvider>,
  ) -> Self {
    let updates = dispatcher.subscribe_updates();
    Self {
      worker,
      state,
      dispatcher,
      updates,
      online: AtomicBool::new(true),
      deferred_prompt: Mutex::new(None),
      permissions,
      permission: Mutex::new(Permission::Default),
    }
  }

  pub fn worker(&self) -> &WorkerHandle {
    &self.worker
  }

  /// Advisory only. Requests are attempted regardless of this flag.
  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Record a connectivity event. Returns true when connectivity was restored.
  pub fn set_online(&self, online: bool) -> bool {
    let was_online = self.online.swap(online, Ordering::SeqCst);
    if was_online != online {
      info!(online, "connectivity changed");
    }
    online && !was_online
  }

  pub fn is_installed(&self) -> bool {
    match self.state.get_state(INSTALLED_KEY) {
      Ok(value) => value.as_deref() == Some("true"),
      Err(e) => {
        warn!(error = %e, "failed to read installed flag");
        false
      }
    }
  }

  pub fn has_update(&self) -> bool {
    *self.updates.borrow()
  }

  /// Keep the installation prompt until the user asks to install.
  pub fn defer_install_prompt(&self, prompt: Box<dyn InstallPrompt>) {
    *self
      .deferred_prompt
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = Some(prompt);
  }

  pub fn can_install(&self) -> bool {
    self
      .deferred_prompt
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some()
  }

  /// Show the deferred prompt. Resolves to `None` when no prompt is available.
  pub async fn install_pwa(&self) -> Result<Option<InstallChoice>> {
    let prompt = self
      .deferred_prompt
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();

    let Some(prompt) = prompt else {
      debug!("no install prompt available");
      return Ok(None);
    };

    let choice = prompt.prompt().await;
    info!(?choice, "install prompt answered");
    if choice == InstallChoice::Accepted {
      self.state.set_state(INSTALLED_KEY, "true")?;
    }
    Ok(Some(choice))
  }

  /// Ask the waiting generation to take over and wait until it does.
  ///
  /// Returns false when there was no update to apply.
  pub async fn update_pwa(&self) -> Result<bool> {
    if !self.has_update() {
      return Ok(false);
    }

    let mut events = self.worker.subscribe_lifecycle();
    self.worker.message(WorkerMessage::SkipWaiting)?;

    tokio::time::timeout(UPDATE_TIMEOUT, wait_for_controller_change(&mut events))
      .await
      .map_err(|_| eyre!("Timed out waiting for the new version to take control"))??;

    info!("new version in control, reload");
    Ok(true)
  }

  /// Post a sync trigger without waiting for the pass to finish.
  pub fn trigger_sync(&self, tag: &str) -> Result<()> {
    self.worker.post(WorkerEvent::Sync(tag.to_string(), None))
  }

  pub fn permission(&self) -> Permission {
    *self
      .permission
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub async fn request_notification_permission(&self) -> Permission {
    let permission = self.permissions.request().await;
    *self
      .permission
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = permission;
    permission
  }

  /// Show a notification if permission was granted.
  pub fn send_notification(&self, title: &str, options: NotificationOptions) -> Option<Notification> {
    if self.permission() != Permission::Granted {
      debug!(title, "notification permission not granted");
      return None;
    }
    let notification = self.dispatcher.build(title.to_string(), options);
    self.dispatcher.show(&notification);
    Some(notification)
  }
}

async fn wait_for_controller_change(events: &mut broadcast::Receiver<LifecycleEvent>) -> Result<()> {
  loop {
    match events.recv().await {
      Ok(LifecycleEvent::ControllerChange) => return Ok(()),
      Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
      Err(broadcast::error::RecvError::Closed) => {
        return Err(eyre!("Worker stopped before the new version took control"))
      }
    }
  }
}
