use crate::controller::{InstallChoice, Permission};
use crate::event::{ChannelPrompt, Event, EventHandler};
use crate::lifecycle::InstallOutcome;
use crate::notify::{ClickOutcome, Notification, ACTION_CLOSE, ACTION_VIEW};
use crate::services::{Services, StatusSnapshot};
use crate::ui;
use color_eyre::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{
  disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::prelude::*;
use std::collections::VecDeque;
use std::io::stdout;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

const MAX_NOTIFICATIONS: usize = 8;

/// Input mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  Normal,
  /// Waiting for y/n on the install prompt
  InstallPrompt,
}

/// Main application state
pub struct App {
  services: Services,

  mode: Mode,

  /// Last status read from the coordinator
  snapshot: Option<StatusSnapshot>,

  /// Most recent first
  notifications: VecDeque<Notification>,

  /// Status line text and whether it reports an error
  message: Option<(String, bool)>,

  /// Answer channel for an open install prompt
  prompt_reply: Option<oneshot::Sender<InstallChoice>>,

  /// Event sender for async tasks
  event_tx: mpsc::UnboundedSender<Event>,

  should_quit: bool,
}

impl App {
  pub fn new(services: Services, event_tx: mpsc::UnboundedSender<Event>) -> Self {
    Self {
      services,
      mode: Mode::Normal,
      snapshot: None,
      notifications: VecDeque::new(),
      message: None,
      prompt_reply: None,
      event_tx,
      should_quit: false,
    }
  }

  /// Run the dashboard until the user quits. `events` must be the handler
  /// whose sender was given to [`App::new`] and to the notification sink.
  pub async fn run(mut self, mut events: EventHandler) -> Result<Services> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let (probe, forward) = self.services.watch_connectivity();
    self
      .services
      .controller
      .defer_install_prompt(Box::new(ChannelPrompt::new(self.event_tx.clone())));
    self.install_generation();
    self.refresh();

    while !self.should_quit {
      terminal.draw(|frame| ui::draw(frame, &self))?;

      if let Some(event) = events.next().await {
        self.handle_event(event);
      }
    }

    probe.abort();
    forward.abort();

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(self.services)
  }

  fn handle_event(&mut self, event: Event) {
    match event {
      Event::Key(key) => self.handle_key(key),
      Event::Tick => self.refresh(),
      Event::Notification(notification) => {
        self.notifications.push_front(notification);
        self.notifications.truncate(MAX_NOTIFICATIONS);
      }
      Event::InstallPrompt(reply) => {
        self.prompt_reply = Some(reply);
        self.mode = Mode::InstallPrompt;
      }
      Event::Message(msg) => {
        self.message = Some((msg, false));
        self.refresh();
      }
      Event::Error(msg) => {
        self.message = Some((msg, true));
      }
    }
  }

  fn handle_key(&mut self, key: KeyEvent) {
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
      self.should_quit = true;
      return;
    }

    match self.mode {
      Mode::Normal => self.handle_normal_mode_key(key),
      Mode::InstallPrompt => self.handle_prompt_key(key),
    }
  }

  fn handle_normal_mode_key(&mut self, key: KeyEvent) {
    match key.code {
      KeyCode::Char('q') => self.should_quit = true,
      KeyCode::Char('i') => self.install_app(),
      KeyCode::Char('u') => self.update_app(),
      KeyCode::Char('s') => self.sync_now(),
      KeyCode::Char('n') => self.request_permission(),
      KeyCode::Char('o') => self.click_notification(ACTION_VIEW),
      KeyCode::Char('x') => self.click_notification(ACTION_CLOSE),
      KeyCode::Char('r') => {
        self.refresh();
        self.message = Some(("Refreshed".to_string(), false));
      }
      _ => {}
    }
  }

  fn handle_prompt_key(&mut self, key: KeyEvent) {
    let choice = match key.code {
      KeyCode::Char('y') | KeyCode::Enter => InstallChoice::Accepted,
      KeyCode::Char('n') | KeyCode::Esc => InstallChoice::Dismissed,
      _ => return,
    };
    if let Some(reply) = self.prompt_reply.take() {
      let _ = reply.send(choice);
    }
    self.mode = Mode::Normal;
  }

  fn refresh(&mut self) {
    match self.services.status() {
      Ok(snapshot) => self.snapshot = Some(snapshot),
      Err(e) => {
        warn!(error = %e, "status refresh failed");
        self.message = Some((e.to_string(), true));
      }
    }
  }

  /// Spawn a background action and report its outcome on the status line.
  fn spawn_action<F>(&self, action: F)
  where
    F: std::future::Future<Output = Result<String>> + Send + 'static,
  {
    let tx = self.event_tx.clone();
    tokio::spawn(async move {
      let event = match action.await {
        Ok(msg) => Event::Message(msg),
        Err(e) => Event::Error(e.to_string()),
      };
      let _ = tx.send(event);
    });
  }

  fn install_generation(&self) {
    let worker = self.services.worker.clone();
    self.spawn_action(async move {
      Ok(match worker.install().await? {
        InstallOutcome::Activated => "Offline cache installed".to_string(),
        InstallOutcome::Waiting => "New version ready, press u to update".to_string(),
        InstallOutcome::UpToDate => "Offline cache up to date".to_string(),
      })
    });
  }

  fn install_app(&mut self) {
    let controller = self.services.controller.clone();
    if controller.is_installed() {
      self.message = Some(("Already installed".to_string(), false));
      return;
    }
    if !controller.can_install() {
      controller.defer_install_prompt(Box::new(ChannelPrompt::new(self.event_tx.clone())));
    }
    self.spawn_action(async move {
      Ok(match controller.install_pwa().await? {
        Some(InstallChoice::Accepted) => "Installed".to_string(),
        Some(InstallChoice::Dismissed) => "Install dismissed".to_string(),
        None => "Install prompt unavailable".to_string(),
      })
    });
  }

  fn update_app(&self) {
    let controller = self.services.controller.clone();
    self.spawn_action(async move {
      Ok(if controller.update_pwa().await? {
        "Updated to the new version".to_string()
      } else {
        "No update available".to_string()
      })
    });
  }

  fn sync_now(&self) {
    let worker = self.services.worker.clone();
    let tag = self.services.config.sync_tag.clone();
    self.spawn_action(async move {
      let report = worker.sync(&tag).await?;
      Ok(format!(
        "Sync: {} replayed, {} remaining",
        report.replayed, report.remaining
      ))
    });
  }

  fn request_permission(&self) {
    let controller = self.services.controller.clone();
    self.spawn_action(async move {
      Ok(match controller.request_notification_permission().await {
        Permission::Granted => "Notifications enabled".to_string(),
        Permission::Denied => "Notifications blocked".to_string(),
        Permission::Default => "Notification permission not decided".to_string(),
      })
    });
  }

  /// Click an action on the newest notification.
  fn click_notification(&mut self, action: &'static str) {
    let Some(notification) = self.notifications.front().cloned() else {
      self.message = Some(("No notifications".to_string(), false));
      return;
    };
    if action == ACTION_CLOSE {
      self.notifications.pop_front();
    }

    let worker = self.services.worker.clone();
    self.spawn_action(async move {
      Ok(
        match worker
          .notification_click(notification, Some(action.to_string()))
          .await?
        {
          ClickOutcome::FocusOrOpen(url) => format!("Opening {}", url),
          ClickOutcome::Dismiss => "Notification dismissed".to_string(),
        },
      )
    });
  }

  pub fn mode(&self) -> Mode {
    self.mode
  }

  pub fn snapshot(&self) -> Option<&StatusSnapshot> {
    self.snapshot.as_ref()
  }

  pub fn notifications(&self) -> &VecDeque<Notification> {
    &self.notifications
  }

  pub fn message(&self) -> Option<(&str, bool)> {
    self.message.as_ref().map(|(m, err)| (m.as_str(), *err))
  }

  pub fn origin(&self) -> &str {
    self.services.config.origin.as_str()
  }

  pub fn permission(&self) -> Permission {
    self.services.controller.permission()
  }
}
