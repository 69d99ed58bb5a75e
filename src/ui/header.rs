use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

/// Draw the header bar with logo, origin, connectivity and shortcuts
pub fn draw_header(frame: &mut Frame, area: Rect, origin: &str, online: bool) {
  let domain = extract_domain(origin);

  let (status, status_color) = if online {
    ("online", Color::Green)
  } else {
    ("offline", Color::Red)
  };

  let mut spans = vec![
    Span::styled(" swcache ", Style::default().fg(Color::Cyan).bold()),
    Span::styled("│", Style::default().fg(Color::DarkGray)),
    Span::styled(format!(" {} ", domain), Style::default().fg(Color::White)),
    Span::styled("│", Style::default().fg(Color::DarkGray)),
    Span::styled(format!(" {} ", status), Style::default().fg(status_color).bold()),
    Span::raw("  "),
  ];

  // Keys highlighted, descriptions dimmed
  for (key, label) in [
    ("<i>", " install"),
    ("<u>", " update"),
    ("<s>", " sync"),
    ("<n>", " notify"),
    ("<r>", " refresh"),
    ("<q>", " quit"),
  ] {
    spans.push(Span::styled(key, Style::default().fg(Color::Cyan)));
    spans.push(Span::styled(label, Style::default().fg(Color::DarkGray)));
    spans.push(Span::raw("   "));
  }

  let paragraph = Paragraph::new(Line::from(spans)).style(Style::default().bg(Color::Black));

  frame.render_widget(paragraph, area);
}

/// Extract host (and port) from the origin URL
fn extract_domain(url: &str) -> &str {
  url
    .strip_prefix("https://")
    .or_else(|| url.strip_prefix("http://"))
    .unwrap_or(url)
    .split('/')
    .next()
    .unwrap_or(url)
}
