mod app;
mod cache;
mod config;
mod connectivity;
mod controller;
mod coordinator;
mod event;
mod lifecycle;
mod logging;
mod net;
mod notify;
mod services;
mod sync;
mod ui;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::controller::{Permission, StaticPermission};
use crate::coordinator::ActionOutcome;
use crate::lifecycle::InstallOutcome;
use crate::net::{Request, Response};
use crate::notify::LogSink;
use crate::services::{Services, StatusSnapshot};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline-first cache, update lifecycle and background sync for a web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Interactive dashboard (default)
  Ui,
  /// Precache the asset manifest for the configured version
  Install,
  /// Activate a waiting version now
  Activate,
  /// Fetch a URL through the cache policies
  Fetch {
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request body; sent as JSON when it parses as JSON
    #[arg(short, long)]
    data: Option<String>,
    /// Accept header, e.g. text/html
    #[arg(long)]
    accept: Option<String>,
  },
  /// Replay queued actions
  Sync,
  /// Show lifecycle, cache and queue state
  Status,
  /// Deliver a push payload (text or JSON)
  Push { payload: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  match args.command.unwrap_or(Command::Ui) {
    Command::Ui => run_dashboard(config).await,
    command => run_command(config, command).await,
  }
}

async fn run_dashboard(config: config::Config) -> Result<()> {
  let events = event::EventHandler::new(Duration::from_millis(250));
  let services = Services::start(
    config,
    Arc::new(event::ChannelSink::new(events.sender())),
    Arc::new(StaticPermission(Permission::Granted)),
  )?;

  let app = app::App::new(services, events.sender());
  let services = app.run(events).await?;
  services.shutdown().await
}

async fn run_command(config: config::Config, command: Command) -> Result<()> {
  let services = Services::start(
    config,
    Arc::new(LogSink),
    Arc::new(StaticPermission(Permission::Granted)),
  )?;

  match command {
    Command::Ui => return Err(eyre!("The dashboard cannot run as a batch command")),
    Command::Install => match services.worker.install().await? {
      InstallOutcome::Activated => println!("Installed and activated"),
      InstallOutcome::Waiting => println!("Installed; waiting to activate (run `swcache activate`)"),
      InstallOutcome::UpToDate => println!("Already up to date"),
    },
    Command::Activate => {
      services.worker.activate().await?;
      println!("Activated");
    }
    Command::Fetch {
      url,
      method,
      data,
      accept,
    } => {
      let request = build_request(&url, &method, data.as_deref(), accept.as_deref())?;
      if request.method == Method::GET {
        print_response(&services.worker.fetch(request).await?);
      } else {
        match services.coordinator.send_action(request).await? {
          ActionOutcome::Sent(response) => print_response(&response),
          ActionOutcome::Queued(id) => println!("Offline; queued as sync task {}", id),
        }
      }
    }
    Command::Sync => {
      let report = services.worker.sync(&services.config.sync_tag).await?;
      println!(
        "Replayed {} of {} queued actions ({} remaining)",
        report.replayed, report.attempted, report.remaining
      );
    }
    Command::Status => print_status(&services.status()?),
    Command::Push { payload } => {
      let shown = services.worker.push(payload.into_bytes()).await?;
      println!("{}: {}", shown.title, shown.body);
      println!("  opens {}", shown.url);
    }
  }

  services.shutdown().await
}

fn build_request(
  url: &str,
  method: &str,
  data: Option<&str>,
  accept: Option<&str>,
) -> Result<Request> {
  let url = url
    .parse::<url::Url>()
    .map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;

  let mut request = Request::new(method, url);
  if let Some(accept) = accept {
    request = request.with_header("accept", accept);
  }
  if let Some(data) = data {
    request = match serde_json::from_str::<serde_json::Value>(data) {
      Ok(json) => request.with_json(&json),
      Err(_) => {
        let mut request = request.with_header("content-type", "text/plain");
        request.body = Some(data.as_bytes().to_vec());
        request
      }
    };
  }
  Ok(request)
}

fn print_response(response: &Response) {
  eprintln!("HTTP {} {}", response.status, response.status_text);
  println!("{}", response.body_text());
}

fn print_status(s: &StatusSnapshot) {
  let lifecycle = s
    .lifecycle
    .map(|l| l.to_string())
    .unwrap_or_else(|| "not installed".to_string());
  println!("version:          {} + {}", s.configured.static_name, s.configured.dynamic_name);
  println!("lifecycle:        {}", lifecycle);
  match &s.active {
    Some(active) => println!(
      "serving:          {} + {}",
      active.static_name, active.dynamic_name
    ),
    None => println!("serving:          none"),
  }
  println!("installed:        {}", s.installed);
  println!("update available: {}", s.update_available);
  println!("pending sync:     {}", s.pending_sync);
  println!("caches:");
  for generation in &s.generations {
    println!("  {:<24} {:>6} entries", generation.name, generation.entries);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_build_request_json_body() {
    let request =
      build_request("https://app.test/api/notes", "post", Some(r#"{"a":1}"#), None).unwrap();

    assert_eq!(request.method, Method::POST);
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.body.as_deref(), Some(br#"{"a":1}"#.as_slice()));
  }

  #[test]
  fn test_build_request_text_body_and_accept() {
    let request = build_request(
      "https://app.test/page",
      "PUT",
      Some("plain words"),
      Some("text/html"),
    )
    .unwrap();

    assert_eq!(request.header("content-type"), Some("text/plain"));
    assert!(request.accepts_html());
  }

  #[test]
  fn test_build_request_rejects_bad_url() {
    assert!(build_request("not a url", "GET", None, None).is_err());
  }

  #[test]
  fn test_cli_parses_fetch() {
    let args = Args::try_parse_from([
      "swcache", "fetch", "https://app.test/api/x", "-X", "POST", "--data", "{}",
    ])
    .unwrap();

    match args.command {
      Some(Command::Fetch { method, data, .. }) => {
        assert_eq!(method, "POST");
        assert_eq!(data.as_deref(), Some("{}"));
      }
      other => panic!("unexpected command {:?}", other),
    }
  }
}
