//! Startup wiring shared by the CLI subcommands and the dashboard.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{GenerationInfo, SqliteStorage};
use crate::config::Config;
use crate::connectivity::{self, ConnectivityMonitor};
use crate::controller::{ClientController, PermissionProvider};
use crate::coordinator::CacheCoordinator;
use crate::lifecycle::{GenerationPair, LifecycleState};
use crate::net::{HttpNetwork, Network};
use crate::notify::{NotificationDispatcher, NotificationSink};
use crate::sync::NetworkReplayer;
use crate::worker::{DispatchTable, RuntimeGuard, WorkerHandle, WorkerRuntime};

/// Point-in-time view of the whole system.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
  pub online: bool,
  pub installed: bool,
  pub update_available: bool,
  pub lifecycle: Option<LifecycleState>,
  pub configured: GenerationPair,
  pub active: Option<GenerationPair>,
  pub generations: Vec<GenerationInfo>,
  pub pending_sync: usize,
}

pub struct Services {
  pub config: Config,
  pub network: Arc<dyn Network>,
  pub coordinator: Arc<CacheCoordinator<SqliteStorage>>,
  pub controller: Arc<ClientController>,
  pub worker: WorkerHandle,
  runtime: RuntimeGuard,
}

impl Services {
  /// Open the database and the HTTP client, then start the worker runtime.
  pub fn start(
    config: Config,
    sink: Arc<dyn NotificationSink>,
    permissions: Arc<dyn PermissionProvider>,
  ) -> Result<Self> {
    let storage = Arc::new(SqliteStorage::open(config.database.path.as_deref())?);
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new()?);
    Self::start_with(config, storage, network, sink, permissions)
  }

  pub fn start_with(
    config: Config,
    storage: Arc<SqliteStorage>,
    network: Arc<dyn Network>,
    sink: Arc<dyn NotificationSink>,
    permissions: Arc<dyn PermissionProvider>,
  ) -> Result<Self> {
    let coordinator_config = config.coordinator_config()?;
    let dispatcher = Arc::new(NotificationDispatcher::new(
      config.notification_style()?,
      sink,
    ));
    let replayer = Arc::new(NetworkReplayer::new(
      Arc::clone(&network),
      coordinator_config.network_first_timeout,
    ));

    let coordinator = Arc::new(CacheCoordinator::new(
      coordinator_config,
      Arc::clone(&storage),
      Arc::clone(&network),
      replayer,
      Arc::clone(&dispatcher),
    )?);

    let (worker, runtime) = WorkerRuntime::spawn(
      DispatchTable::new().register(Arc::clone(&coordinator)),
      coordinator.lifecycle_events(),
    );

    let controller = Arc::new(ClientController::new(
      worker.clone(),
      storage,
      dispatcher,
      permissions,
    ));

    info!(origin = %config.origin, "services started");

    Ok(Self {
      config,
      network,
      coordinator,
      controller,
      worker,
      runtime,
    })
  }

  /// Start probing the origin and feed the results to the controller.
  pub fn watch_connectivity(&self) -> (JoinHandle<()>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let monitor = ConnectivityMonitor::new(
      Arc::clone(&self.network),
      self.config.origin.clone(),
      Duration::from_millis(self.config.connectivity.probe_interval_ms),
      Duration::from_millis(self.config.connectivity.probe_timeout_ms),
    );
    let probe = monitor.spawn(tx);
    let forward = connectivity::forward(
      rx,
      Arc::clone(&self.controller),
      self.config.sync_tag.clone(),
    );
    (probe, forward)
  }

  pub fn status(&self) -> Result<StatusSnapshot> {
    let lifecycle = self.coordinator.lifecycle();
    Ok(StatusSnapshot {
      online: self.controller.is_online(),
      installed: self.controller.is_installed(),
      update_available: self.controller.has_update(),
      lifecycle: lifecycle.state(),
      configured: lifecycle.pair().clone(),
      active: lifecycle.active_pair()?,
      generations: self.coordinator.generations()?,
      pending_sync: self.coordinator.pending_sync()?,
    })
  }

  /// Stop the worker runtime once in-flight handlers have finished.
  pub async fn shutdown(self) -> Result<()> {
    self.runtime.shutdown().await
  }
}
