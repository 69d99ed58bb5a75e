//! Online/offline detection.
//!
//! The monitor probes the application origin and reports transitions only.
//! Results are advisory: nothing gates a request on them.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::controller::ClientController;
use crate::net::{attempt_network, Network, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

pub struct ConnectivityMonitor {
  network: Arc<dyn Network>,
  target: Url,
  interval: Duration,
  timeout: Duration,
}

impl ConnectivityMonitor {
  pub fn new(network: Arc<dyn Network>, target: Url, interval: Duration, timeout: Duration) -> Self {
    Self {
      network,
      target,
      interval,
      timeout,
    }
  }

  /// Any HTTP response counts as online, whatever its status.
  pub async fn probe(&self) -> Connectivity {
    let request = Request::new(Method::HEAD, self.target.clone());
    match attempt_network(self.network.as_ref(), &request, self.timeout).await {
      Ok(_) => Connectivity::Online,
      Err(failure) => {
        debug!(%failure, "connectivity probe failed");
        Connectivity::Offline
      }
    }
  }

  /// Probe on an interval, sending a value on every transition. The first
  /// probe always reports. Stops when the receiver is dropped.
  pub fn spawn(self, tx: mpsc::UnboundedSender<Connectivity>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      let mut last = None;

      loop {
        tokio::select! {
          _ = tx.closed() => break,
          _ = ticker.tick() => {}
        }
        let current = self.probe().await;
        if last == Some(current) {
          continue;
        }
        last = Some(current);
        if tx.send(current).is_err() {
          break;
        }
      }
    })
  }
}

/// Apply connectivity events to the controller; restoring connectivity
/// triggers a background sync for `tag`.
pub fn forward(
  mut rx: mpsc::UnboundedReceiver<Connectivity>,
  controller: Arc<ClientController>,
  tag: String,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    while let Some(connectivity) = rx.recv().await {
      let restored = controller.set_online(connectivity == Connectivity::Online);
      if restored {
        info!(tag = %tag, "connectivity restored, triggering sync");
        if let Err(e) = controller.trigger_sync(&tag) {
          warn!(error = %e, "failed to trigger sync");
          break;
        }
      }
    }
  })
}
