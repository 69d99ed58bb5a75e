//! User-visible events: push notifications and the update-available flag.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

pub const ACTION_VIEW: &str = "view";
pub const ACTION_EXPLORE: &str = "explore";
pub const ACTION_CLOSE: &str = "close";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// Caller-supplied overrides for a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationOptions {
  pub body: Option<String>,
  pub icon: Option<String>,
  pub badge: Option<String>,
  /// Page to open on click; defaults to the application root
  pub url: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub actions: Vec<NotificationAction>,
  pub url: Url,
}

/// Fixed presentation for every notification the application shows.
#[derive(Debug, Clone)]
pub struct NotificationStyle {
  pub title: String,
  pub icon: String,
  pub badge: String,
  pub root: Url,
}

/// Where rendered notifications end up (OS notification centre, a TUI panel, logs).
pub trait NotificationSink: Send + Sync {
  fn show(&self, notification: &Notification);
}

/// Sink for headless runs: notifications only reach the log.
pub struct LogSink;

impl NotificationSink for LogSink {
  fn show(&self, notification: &Notification) {
    info!(title = %notification.title, body = %notification.body, "notification");
  }
}

/// Result of a notification click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// Focus an existing window on the URL, or open one
  FocusOrOpen(Url),
  Dismiss,
}

/// Structured push payload; any other payload is shown as plain text.
#[derive(Debug, Deserialize)]
struct PushMessage {
  title: Option<String>,
  body: Option<String>,
  url: Option<String>,
}

pub struct NotificationDispatcher {
  style: NotificationStyle,
  sink: Arc<dyn NotificationSink>,
  update_available: watch::Sender<bool>,
}

impl NotificationDispatcher {
  pub fn new(style: NotificationStyle, sink: Arc<dyn NotificationSink>) -> Self {
    let (update_available, _) = watch::channel(false);
    Self {
      style,
      sink,
      update_available,
    }
  }

  /// Receiver for the client controller's "update available" flag.
  pub fn subscribe_updates(&self) -> watch::Receiver<bool> {
    self.update_available.subscribe()
  }

  /// Routed to the client controller flag, never to an OS notification.
  pub fn notify_update_available(&self) {
    info!("update available");
    self.update_available.send_replace(true);
  }

  pub fn clear_update(&self) {
    self.update_available.send_replace(false);
  }

  pub fn notify_push(&self, payload: &[u8]) -> Notification {
    let notification = self.render_push(payload);
    self.show(&notification);
    notification
  }

  pub fn show(&self, notification: &Notification) {
    self.sink.show(notification);
  }

  pub fn render_push(&self, payload: &[u8]) -> Notification {
    let (title, body, url) = if let Ok(message) = serde_json::from_slice::<PushMessage>(payload) {
      let url = message.url.and_then(|u| self.same_origin(&u));
      let body = message
        .body
        .unwrap_or_else(|| String::from_utf8_lossy(payload).into_owned());
      (message.title, body, url)
    } else if let Ok(text) = serde_json::from_slice::<String>(payload) {
      (None, text, None)
    } else {
      (None, String::from_utf8_lossy(payload).into_owned(), None)
    };

    self.build(
      title.unwrap_or_else(|| self.style.title.clone()),
      NotificationOptions {
        body: Some(body),
        url,
        ..Default::default()
      },
    )
  }

  /// Resolve a payload link against the root. Links to other origins are dropped.
  fn same_origin(&self, link: &str) -> Option<Url> {
    let url = self.style.root.join(link).ok()?;
    if url.origin() == self.style.root.origin() {
      Some(url)
    } else {
      debug!(url = %url, "ignoring cross-origin notification link");
      None
    }
  }

  /// Apply the fixed icon, badge and action set.
  pub fn build(&self, title: String, options: NotificationOptions) -> Notification {
    Notification {
      title,
      body: options.body.unwrap_or_default(),
      icon: options.icon.unwrap_or_else(|| self.style.icon.clone()),
      badge: options.badge.unwrap_or_else(|| self.style.badge.clone()),
      actions: vec![
        NotificationAction {
          action: ACTION_VIEW.to_string(),
          title: "View".to_string(),
        },
        NotificationAction {
          action: ACTION_CLOSE.to_string(),
          title: "Close".to_string(),
        },
      ],
      url: options.url.unwrap_or_else(|| self.style.root.clone()),
    }
  }

  /// `view` (or `explore`, or a click on the body) opens the target page;
  /// `close` only dismisses.
  pub fn handle_click(&self, notification: &Notification, action: Option<&str>) -> ClickOutcome {
    match action {
      None | Some(ACTION_VIEW) | Some(ACTION_EXPLORE) => {
        ClickOutcome::FocusOrOpen(notification.url.clone())
      }
      Some(ACTION_CLOSE) => ClickOutcome::Dismiss,
      Some(other) => {
        debug!(action = other, "unknown notification action");
        ClickOutcome::Dismiss
      }
    }
  }
}
