use crate::cache::GenerationInfo;
use crate::controller::Permission;
use crate::lifecycle::LifecycleState;
use crate::notify::Notification;
use crate::services::StatusSnapshot;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, Paragraph};
use std::collections::VecDeque;

/// Truncate a string to a maximum number of characters, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

pub fn lifecycle_color(state: Option<LifecycleState>) -> Color {
  match state {
    Some(LifecycleState::Activated) => Color::Green,
    Some(LifecycleState::InstalledWaiting) => Color::Yellow,
    Some(LifecycleState::Installing) | Some(LifecycleState::Activating) => Color::Cyan,
    None => Color::DarkGray,
  }
}

fn yes_no(value: bool) -> Span<'static> {
  if value {
    Span::styled("yes", Style::default().fg(Color::Green))
  } else {
    Span::styled("no", Style::default().fg(Color::DarkGray))
  }
}

fn row<'a>(label: &'a str, value: Span<'a>) -> Line<'a> {
  Line::from(vec![
    Span::styled(format!("{:<18}", label), Style::default().fg(Color::DarkGray)),
    value,
  ])
}

pub fn draw_status(
  frame: &mut Frame,
  area: Rect,
  snapshot: Option<&StatusSnapshot>,
  permission: Permission,
) {
  let block = Block::default().borders(Borders::ALL).title(" Status ");

  let Some(s) = snapshot else {
    frame.render_widget(Paragraph::new("Loading...").block(block), area);
    return;
  };

  let lifecycle = s
    .lifecycle
    .map(|l| l.to_string())
    .unwrap_or_else(|| "not installed".to_string());
  let active = s
    .active
    .as_ref()
    .map(|p| format!("{} + {}", p.static_name, p.dynamic_name))
    .unwrap_or_else(|| "none".to_string());
  let pending_style = if s.pending_sync > 0 {
    Style::default().fg(Color::Yellow)
  } else {
    Style::default().fg(Color::White)
  };

  let lines = vec![
    row(
      "lifecycle",
      Span::styled(lifecycle, Style::default().fg(lifecycle_color(s.lifecycle))),
    ),
    row(
      "version",
      Span::raw(format!(
        "{} + {}",
        s.configured.static_name, s.configured.dynamic_name
      )),
    ),
    row("serving", Span::raw(active)),
    row("installed", yes_no(s.installed)),
    row("update available", yes_no(s.update_available)),
    row(
      "pending sync",
      Span::styled(s.pending_sync.to_string(), pending_style),
    ),
    row("notifications", Span::raw(format!("{:?}", permission).to_lowercase())),
  ];

  frame.render_widget(Paragraph::new(lines).block(block), area);
}

pub fn draw_generations(frame: &mut Frame, area: Rect, generations: &[GenerationInfo]) {
  let items: Vec<ListItem> = generations
    .iter()
    .map(|g| {
      ListItem::new(Line::from(vec![
        Span::styled(format!(" {:<24}", g.name), Style::default().fg(Color::White)),
        Span::styled(
          format!("{:>6} entries", g.entries),
          Style::default().fg(Color::DarkGray),
        ),
      ]))
    })
    .collect();

  let list = List::new(items).block(
    Block::default()
      .borders(Borders::ALL)
      .title(" Cache generations "),
  );
  frame.render_widget(list, area);
}

pub fn draw_notifications(frame: &mut Frame, area: Rect, notifications: &VecDeque<Notification>) {
  let width = area.width.saturating_sub(4) as usize;
  let items: Vec<ListItem> = notifications
    .iter()
    .map(|n| {
      let title = truncate(&n.title, 24);
      let body_width = width.saturating_sub(title.chars().count() + 3);
      ListItem::new(Line::from(vec![
        Span::styled(format!(" {} ", title), Style::default().fg(Color::Cyan).bold()),
        Span::raw(truncate(&n.body, body_width)),
      ]))
    })
    .collect();

  let list = List::new(items).block(
    Block::default()
      .borders(Borders::ALL)
      .title(" Notifications "),
  );
  frame.render_widget(list, area);
}

/// Centered y/n overlay for the install prompt
pub fn draw_install_prompt(frame: &mut Frame, area: Rect, origin: &str) {
  let width = (area.width / 10 * 6).clamp(30, 60);
  let height = 5;
  let overlay = Rect::new(
    area.x + area.width.saturating_sub(width) / 2,
    area.y + area.height.saturating_sub(height) / 2,
    width.min(area.width),
    height.min(area.height),
  );

  frame.render_widget(Clear, overlay);

  let lines = vec![
    Line::from(format!("Install {}?", truncate(origin, (width as usize).saturating_sub(12)))),
    Line::from(""),
    Line::from(vec![
      Span::styled("<y>", Style::default().fg(Color::Cyan)),
      Span::styled(" install   ", Style::default().fg(Color::DarkGray)),
      Span::styled("<n>", Style::default().fg(Color::Cyan)),
      Span::styled(" not now", Style::default().fg(Color::DarkGray)),
    ]),
  ];

  let paragraph = Paragraph::new(lines).alignment(Alignment::Center).block(
    Block::default()
      .borders(Borders::ALL)
      .border_style(Style::default().fg(Color::Yellow))
      .title(" Install app "),
  );
  frame.render_widget(paragraph, overlay);
}
