use crossterm::event::{self, Event as CrosstermEvent, KeyEvent};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::controller::{InstallChoice, InstallPrompt};
use crate::notify::{Notification, NotificationSink};

/// Application events
#[derive(Debug)]
pub enum Event {
  /// Terminal key press
  Key(KeyEvent),
  /// Periodic tick for UI refresh
  Tick,
  /// A notification was shown
  Notification(Notification),
  /// The install prompt wants an answer
  InstallPrompt(oneshot::Sender<InstallChoice>),
  /// Result of a background action, for the status line
  Message(String),
  Error(String),
}

/// Event handler that produces events from terminal input and a tick timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let input_tx = tx.clone();
    tokio::spawn(async move {
      loop {
        if event::poll(tick_rate).unwrap_or(false) {
          if let Ok(CrosstermEvent::Key(key)) = event::read() {
            if input_tx.send(Event::Key(key)).is_err() {
              break;
            }
          }
        } else if input_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for background tasks
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

/// Shows notifications in the dashboard.
pub struct ChannelSink {
  tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
  pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
    Self { tx }
  }
}

impl NotificationSink for ChannelSink {
  fn show(&self, notification: &Notification) {
    let _ = self.tx.send(Event::Notification(notification.clone()));
  }
}

/// Asks the user through the dashboard's y/n prompt.
pub struct ChannelPrompt {
  tx: mpsc::UnboundedSender<Event>,
}

impl ChannelPrompt {
  pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
    Self { tx }
  }
}

impl InstallPrompt for ChannelPrompt {
  fn prompt(&self) -> BoxFuture<'_, InstallChoice> {
    Box::pin(async move {
      let (reply, choice) = oneshot::channel();
      if self.tx.send(Event::InstallPrompt(reply)).is_err() {
        return InstallChoice::Dismissed;
      }
      // A closed dashboard counts as dismissal
      choice.await.unwrap_or(InstallChoice::Dismissed)
    })
  }
}
