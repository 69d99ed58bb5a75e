mod header;
mod panels;

use crate::app::{App, Mode};
use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

/// Main draw function
pub fn draw(frame: &mut Frame, app: &App) {
  let online = app.snapshot().map(|s| s.online).unwrap_or(true);

  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .constraints([
      Constraint::Length(1), // Header
      Constraint::Min(1),    // Main content
      Constraint::Length(1), // Status bar
    ])
    .split(frame.area());

  header::draw_header(frame, chunks[0], app.origin(), online);

  let body = Layout::default()
    .direction(Direction::Vertical)
    .constraints([Constraint::Length(9), Constraint::Min(3)])
    .split(chunks[1]);
  let top = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
    .split(body[0]);

  panels::draw_status(frame, top[0], app.snapshot(), app.permission());
  let generations = app
    .snapshot()
    .map(|s| s.generations.as_slice())
    .unwrap_or(&[]);
  panels::draw_generations(frame, top[1], generations);
  panels::draw_notifications(frame, body[1], app.notifications());

  if app.mode() == Mode::InstallPrompt {
    panels::draw_install_prompt(frame, chunks[1], app.origin());
  }

  draw_status_bar(frame, chunks[2], app);
}

fn draw_status_bar(frame: &mut Frame, area: Rect, app: &App) {
  let (content, style) = match (app.mode(), app.message()) {
    (Mode::InstallPrompt, _) => (
      " Install the app? y/n".to_string(),
      Style::default().fg(Color::Yellow),
    ),
    (Mode::Normal, Some((msg, true))) => (format!(" {}", msg), Style::default().fg(Color::Red)),
    (Mode::Normal, Some((msg, false))) => (format!(" {}", msg), Style::default().fg(Color::White)),
    (Mode::Normal, None) => (
      " i:install  u:update  s:sync  n:notifications  o:open  x:close  r:refresh  q:quit".to_string(),
      Style::default().fg(Color::DarkGray),
    ),
  };

  let paragraph = Paragraph::new(content).style(style);
  frame.render_widget(paragraph, area);
}
