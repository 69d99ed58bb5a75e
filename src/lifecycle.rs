//! Install / activate lifecycle of a cache generation pair.
//!
//! ```text
//! (none) --install--> installing --ok--> installed-waiting --skip waiting--> activating --> activated
//!                         |                                                       |
//!                         +--asset failure--> previous state               evict stale generations
//! ```
//!
//! The first install with nothing active activates immediately. Later installs
//! wait until the client asks to skip waiting.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CachedEntry, RequestKey};
use crate::net::{attempt_network, FetchFailure, Network, Request};

const ACTIVE_STATIC: &str = "active_static";
const ACTIVE_DYNAMIC: &str = "active_dynamic";
const WAITING_STATIC: &str = "waiting_static";
const WAITING_DYNAMIC: &str = "waiting_dynamic";

/// Small key/value store for lifecycle bookkeeping that must survive restarts.
pub trait StateStore: Send + Sync {
  fn get_state(&self, key: &str) -> Result<Option<String>>;
  fn set_state(&self, key: &str, value: &str) -> Result<()>;
  fn clear_state(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  InstalledWaiting,
  Activating,
  Activated,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LifecycleState::Installing => write!(f, "installing"),
      LifecycleState::InstalledWaiting => write!(f, "installed-waiting"),
      LifecycleState::Activating => write!(f, "activating"),
      LifecycleState::Activated => write!(f, "activated"),
    }
  }
}

/// Broadcast to every client controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  /// A new generation finished installing and is waiting
  UpdateAvailable,
  /// A generation was activated and now serves all clients
  ControllerChange,
}

/// The static and dynamic cache names of one deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationPair {
  pub static_name: String,
  pub dynamic_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
  /// Nothing was active, so the new pair took over immediately
  Activated,
  /// Installed alongside an active pair; waiting for skip-waiting
  Waiting,
  /// The configured pair is already active
  UpToDate,
}

#[derive(Debug, Error)]
pub enum InstallError {
  #[error("install already in progress")]
  InProgress,
  #[error("failed to fetch asset {url}: {failure}")]
  AssetUnavailable { url: String, failure: FetchFailure },
  #[error("asset {url} returned HTTP {status}")]
  AssetRejected { url: String, status: u16 },
  #[error("cache storage error: {0}")]
  Storage(String),
}

pub struct LifecycleManager<S> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  pair: GenerationPair,
  manifest: Vec<Url>,
  timeout: Duration,
  state: Mutex<Option<LifecycleState>>,
  events: broadcast::Sender<LifecycleEvent>,
}

impl<S: CacheStorage + StateStore> LifecycleManager<S> {
  /// Create a manager for `pair`, restoring its state from the store.
  pub fn new(
    storage: Arc<S>,
    network: Arc<dyn Network>,
    pair: GenerationPair,
    manifest: Vec<Url>,
    timeout: Duration,
  ) -> Result<Self> {
    let state = if read_pair(storage.as_ref(), ACTIVE_STATIC, ACTIVE_DYNAMIC)?.as_ref() == Some(&pair)
    {
      Some(LifecycleState::Activated)
    } else if read_pair(storage.as_ref(), WAITING_STATIC, WAITING_DYNAMIC)?.as_ref() == Some(&pair) {
      Some(LifecycleState::InstalledWaiting)
    } else {
      None
    };

    let (events, _) = broadcast::channel(16);

    Ok(Self {
      storage,
      network,
      pair,
      manifest,
      timeout,
      state: Mutex::new(state),
      events,
    })
  }

  /// Current state of the configured pair; `None` until it has been installed.
  pub fn state(&self) -> Option<LifecycleState> {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn pair(&self) -> &GenerationPair {
    &self.pair
  }

  /// The pair currently serving clients, which may belong to an older deploy.
  pub fn active_pair(&self) -> Result<Option<GenerationPair>> {
    read_pair(self.storage.as_ref(), ACTIVE_STATIC, ACTIVE_DYNAMIC)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
    self.events.subscribe()
  }

  pub fn sender(&self) -> broadcast::Sender<LifecycleEvent> {
    self.events.clone()
  }

  fn set_state(&self, state: Option<LifecycleState>) -> Option<LifecycleState> {
    let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *guard, state)
  }

  /// Pre-populate the static generation from the asset manifest.
  ///
  /// Any asset failure aborts the install and leaves the previous state and
  /// the previously active generation untouched.
  pub async fn install(&self) -> Result<InstallOutcome, InstallError> {
    let previous = {
      let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
      match *guard {
        Some(LifecycleState::Activated) => return Ok(InstallOutcome::UpToDate),
        Some(LifecycleState::Installing) | Some(LifecycleState::Activating) => {
          return Err(InstallError::InProgress)
        }
        previous => {
          *guard = Some(LifecycleState::Installing);
          previous
        }
      }
    };

    info!(cache = %self.pair.static_name, assets = self.manifest.len(), "installing");

    if let Err(e) = self.precache().await {
      warn!(cache = %self.pair.static_name, error = %e, "install aborted");
      self.set_state(previous);
      return Err(e);
    }

    let persisted = self
      .storage
      .set_state(WAITING_STATIC, &self.pair.static_name)
      .and_then(|_| {
        self
          .storage
          .set_state(WAITING_DYNAMIC, &self.pair.dynamic_name)
      });
    if let Err(e) = persisted {
      self.set_state(previous);
      return Err(InstallError::Storage(e.to_string()));
    }
    self.set_state(Some(LifecycleState::InstalledWaiting));

    let active = self
      .active_pair()
      .map_err(|e| InstallError::Storage(e.to_string()))?;

    if active.is_none() {
      self
        .activate()
        .map_err(|e| InstallError::Storage(e.to_string()))?;
      return Ok(InstallOutcome::Activated);
    }

    info!(cache = %self.pair.static_name, "installed, waiting to activate");
    let _ = self.events.send(LifecycleEvent::UpdateAvailable);
    Ok(InstallOutcome::Waiting)
  }

  async fn precache(&self) -> Result<(), InstallError> {
    let mut entries = Vec::with_capacity(self.manifest.len());

    for url in &self.manifest {
      let request = Request::get(url.clone());
      let response = attempt_network(self.network.as_ref(), &request, self.timeout)
        .await
        .map_err(|failure| InstallError::AssetUnavailable {
          url: url.to_string(),
          failure,
        })?;

      let entry = CachedEntry::snapshot(&response).ok_or_else(|| InstallError::AssetRejected {
        url: url.to_string(),
        status: response.status,
      })?;

      debug!(url = %url, bytes = entry.body.len(), "precached asset");
      entries.push((RequestKey::of(&request), entry));
    }

    self
      .storage
      .put_all(&self.pair.static_name, &entries)
      .map_err(|e| InstallError::Storage(e.to_string()))
  }

  /// Make the waiting pair authoritative and evict every other generation.
  pub fn activate(&self) -> Result<()> {
    {
      let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
      if *guard != Some(LifecycleState::InstalledWaiting) {
        return Err(eyre!(
          "No installed generation is waiting (state: {})",
          guard.map(|s| s.to_string()).unwrap_or_else(|| "none".into())
        ));
      }
      *guard = Some(LifecycleState::Activating);
    }

    info!(static_cache = %self.pair.static_name, dynamic_cache = %self.pair.dynamic_name, "activating");

    if let Err(e) = self.commit_activation() {
      warn!(cache = %self.pair.static_name, error = %e, "activation failed, still waiting");
      self.set_state(Some(LifecycleState::InstalledWaiting));
      return Err(e);
    }

    self.set_state(Some(LifecycleState::Activated));
    info!(cache = %self.pair.static_name, "activated, claiming clients");
    let _ = self.events.send(LifecycleEvent::ControllerChange);
    Ok(())
  }

  /// Persist the pair as active, then drop every other generation.
  fn commit_activation(&self) -> Result<()> {
    self
      .storage
      .set_state(ACTIVE_STATIC, &self.pair.static_name)?;
    self
      .storage
      .set_state(ACTIVE_DYNAMIC, &self.pair.dynamic_name)?;
    self.storage.clear_state(WAITING_STATIC)?;
    self.storage.clear_state(WAITING_DYNAMIC)?;

    if let Err(e) = self.storage.open(&self.pair.dynamic_name) {
      warn!(cache = %self.pair.dynamic_name, error = %e, "failed to open dynamic cache");
    }
    self.evict_stale();
    Ok(())
  }

  /// Activate right away if a pair is waiting; otherwise nothing to do.
  pub fn skip_waiting(&self) -> Result<()> {
    match self.state() {
      Some(LifecycleState::InstalledWaiting) => self.activate(),
      state => {
        debug!(?state, "skip waiting ignored, nothing is waiting");
        Ok(())
      }
    }
  }

  fn evict_stale(&self) {
    let names = match self.storage.keys() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "failed to enumerate cache generations");
        return;
      }
    };

    for name in names {
      if name == self.pair.static_name || name == self.pair.dynamic_name {
        continue;
      }
      match self.storage.delete(&name) {
        Ok(_) => info!(cache = %name, "deleted stale cache generation"),
        Err(e) => warn!(cache = %name, error = %e, "failed to delete stale cache generation"),
      }
    }
  }
}

fn read_pair<S: StateStore + ?Sized>(
  store: &S,
  static_key: &str,
  dynamic_key: &str,
) -> Result<Option<GenerationPair>> {
  match (store.get_state(static_key)?, store.get_state(dynamic_key)?) {
    (Some(static_name), Some(dynamic_name)) => Ok(Some(GenerationPair {
      static_name,
      dynamic_name,
    })),
    _ => Ok(None),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::net::fake::FakeNetwork;
  use crate::net::Response;
  use std::sync::atomic::{AtomicBool, Ordering};

  const ORIGIN: &str = "https://app.test";

  fn pair(version: &str) -> GenerationPair {
    GenerationPair {
      static_name: format!("static-{}", version),
      dynamic_name: format!("dynamic-{}", version),
    }
  }

  fn manifest() -> Vec<Url> {
    ["/", "/manifest.json", "/favicon.ico"]
      .iter()
      .map(|p| format!("{}{}", ORIGIN, p).parse().unwrap())
      .collect()
  }

  fn network() -> Arc<FakeNetwork> {
    Arc::new(
      FakeNetwork::new()
        .route("https://app.test/", Response::text(200, "<html>v1</html>"))
        .route("https://app.test/manifest.json", Response::text(200, "{}"))
        .route("https://app.test/favicon.ico", Response::text(200, "icon")),
    )
  }

  fn manager(
    storage: &Arc<SqliteStorage>,
    network: &Arc<FakeNetwork>,
    version: &str,
  ) -> LifecycleManager<SqliteStorage> {
    LifecycleManager::new(
      Arc::clone(storage),
      network.clone(),
      pair(version),
      manifest(),
      Duration::from_secs(1),
    )
    .unwrap()
  }

  /// SQLite storage that can be told to fail deletes, or the next state write.
  #[derive(Default)]
  struct FlakyStorage {
    inner: Option<SqliteStorage>,
    fail_delete: AtomicBool,
    fail_next_write: AtomicBool,
  }

  impl FlakyStorage {
    fn new() -> Self {
      Self {
        inner: Some(SqliteStorage::open_in_memory().unwrap()),
        ..Default::default()
      }
    }

    fn db(&self) -> &SqliteStorage {
      self.inner.as_ref().unwrap()
    }
  }

  impl CacheStorage for FlakyStorage {
    fn open(&self, name: &str) -> Result<()> {
      self.db().open(name)
    }

    fn keys(&self) -> Result<Vec<String>> {
      self.db().keys()
    }

    fn delete(&self, name: &str) -> Result<bool> {
      if self.fail_delete.load(Ordering::SeqCst) {
        return Err(eyre!("disk is read-only"));
      }
      self.db().delete(name)
    }

    fn put(&self, name: &str, key: &RequestKey, entry: &CachedEntry) -> Result<()> {
      self.db().put(name, key, entry)
    }

    fn put_all(&self, name: &str, entries: &[(RequestKey, CachedEntry)]) -> Result<()> {
      self.db().put_all(name, entries)
    }

    fn match_in(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
      self.db().match_in(name, key)
    }

    fn match_any(&self, key: &RequestKey) -> Result<Option<CachedEntry>> {
      self.db().match_any(key)
    }

    fn entry_count(&self, name: &str) -> Result<usize> {
      self.db().entry_count(name)
    }
  }

  impl StateStore for FlakyStorage {
    fn get_state(&self, key: &str) -> Result<Option<String>> {
      self.db().get_state(key)
    }

    fn set_state(&self, key: &str, value: &str) -> Result<()> {
      if self.fail_next_write.swap(false, Ordering::SeqCst) {
        return Err(eyre!("database is locked"));
      }
      self.db().set_state(key, value)
    }

    fn clear_state(&self, key: &str) -> Result<()> {
      self.db().clear_state(key)
    }
  }

  fn flaky_manager(
    storage: &Arc<FlakyStorage>,
    network: &Arc<FakeNetwork>,
    version: &str,
  ) -> LifecycleManager<FlakyStorage> {
    LifecycleManager::new(
      Arc::clone(storage),
      network.clone(),
      pair(version),
      manifest(),
      Duration::from_secs(1),
    )
    .unwrap()
  }

  fn root_key() -> RequestKey {
    RequestKey::get("https://app.test/".parse().unwrap())
  }

  #[tokio::test]
  async fn test_first_install_activates_immediately() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let lifecycle = manager(&storage, &network, "v1");
    let mut events = lifecycle.subscribe();

    let outcome = lifecycle.install().await.unwrap();

    assert_eq!(outcome, InstallOutcome::Activated);
    assert_eq!(lifecycle.state(), Some(LifecycleState::Activated));
    assert_eq!(lifecycle.active_pair().unwrap(), Some(pair("v1")));
    assert_eq!(storage.entry_count("static-v1").unwrap(), 3);
    assert_eq!(events.try_recv().unwrap(), LifecycleEvent::ControllerChange);
  }

  #[tokio::test]
  async fn test_install_is_noop_when_up_to_date() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    manager(&storage, &network, "v1").install().await.unwrap();
    let calls = network.call_count();

    let restarted = manager(&storage, &network, "v1");
    assert_eq!(restarted.state(), Some(LifecycleState::Activated));
    assert_eq!(
      restarted.install().await.unwrap(),
      InstallOutcome::UpToDate
    );
    assert_eq!(network.call_count(), calls);
  }

  #[tokio::test]
  async fn test_failed_asset_aborts_install_and_keeps_previous_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    manager(&storage, &network, "v1").install().await.unwrap();

    network.set_route("https://app.test/", Response::text(200, "<html>v2</html>"));
    network.set_route("https://app.test/favicon.ico", Response::text(404, "missing"));
    let next = manager(&storage, &network, "v2");

    let result = next.install().await;

    assert!(matches!(
      result,
      Err(InstallError::AssetRejected { status: 404, .. })
    ));
    assert_eq!(next.state(), None);
    assert!(!storage.keys().unwrap().contains(&"static-v2".to_string()));
    assert_eq!(next.active_pair().unwrap(), Some(pair("v1")));
    let served = storage.match_any(&root_key()).unwrap().unwrap();
    assert_eq!(served.body, b"<html>v1</html>");
  }

  #[tokio::test]
  async fn test_unreachable_asset_aborts_install() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    manager(&storage, &network, "v1").install().await.unwrap();

    network.set_offline(true);
    let next = manager(&storage, &network, "v2");

    assert!(matches!(
      next.install().await,
      Err(InstallError::AssetUnavailable {
        failure: FetchFailure::Transport(_),
        ..
      })
    ));
    assert_eq!(next.state(), None);
    assert_eq!(next.active_pair().unwrap(), Some(pair("v1")));
    assert!(!storage.keys().unwrap().contains(&"static-v2".to_string()));
  }

  #[tokio::test]
  async fn test_slow_asset_times_out_install() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(
      FakeNetwork::new()
        .route("https://app.test/", Response::text(200, "<html>v1</html>"))
        .with_delay(Duration::from_millis(200)),
    );
    let lifecycle = LifecycleManager::new(
      Arc::clone(&storage),
      network,
      pair("v1"),
      vec!["https://app.test/".parse().unwrap()],
      Duration::from_millis(20),
    )
    .unwrap();

    assert!(matches!(
      lifecycle.install().await,
      Err(InstallError::AssetUnavailable {
        failure: FetchFailure::Timeout(_),
        ..
      })
    ));
    assert_eq!(lifecycle.state(), None);
    assert!(storage.keys().unwrap().is_empty());
    assert_eq!(lifecycle.active_pair().unwrap(), None);
  }

  #[tokio::test]
  async fn test_failed_delete_does_not_block_activation() {
    let storage = Arc::new(FlakyStorage::new());
    let network = network();
    flaky_manager(&storage, &network, "v1").install().await.unwrap();
    let next = flaky_manager(&storage, &network, "v2");
    assert_eq!(next.install().await.unwrap(), InstallOutcome::Waiting);

    storage.fail_delete.store(true, Ordering::SeqCst);
    next.skip_waiting().unwrap();

    assert_eq!(next.state(), Some(LifecycleState::Activated));
    assert_eq!(next.active_pair().unwrap(), Some(pair("v2")));
    // The stale generation could not be deleted and is left behind
    assert!(storage.keys().unwrap().contains(&"static-v1".to_string()));
  }

  #[tokio::test]
  async fn test_failed_activation_stays_waiting_and_can_retry() {
    let storage = Arc::new(FlakyStorage::new());
    let network = network();
    flaky_manager(&storage, &network, "v1").install().await.unwrap();
    let next = flaky_manager(&storage, &network, "v2");
    assert_eq!(next.install().await.unwrap(), InstallOutcome::Waiting);

    storage.fail_next_write.store(true, Ordering::SeqCst);
    assert!(next.skip_waiting().is_err());

    assert_eq!(next.state(), Some(LifecycleState::InstalledWaiting));
    assert_eq!(next.active_pair().unwrap(), Some(pair("v1")));
    assert!(storage.keys().unwrap().contains(&"static-v1".to_string()));

    next.skip_waiting().unwrap();
    assert_eq!(next.state(), Some(LifecycleState::Activated));
    assert_eq!(next.active_pair().unwrap(), Some(pair("v2")));
  }

  #[tokio::test]
  async fn test_update_waits_then_skip_waiting_evicts_old_generations() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    manager(&storage, &network, "v1").install().await.unwrap();
    storage.open("dynamic-v1").unwrap();
    storage.open("leftover-v0").unwrap();

    let next = manager(&storage, &network, "v2");
    let mut events = next.subscribe();
    assert_eq!(next.install().await.unwrap(), InstallOutcome::Waiting);
    assert_eq!(next.state(), Some(LifecycleState::InstalledWaiting));
    assert_eq!(events.try_recv().unwrap(), LifecycleEvent::UpdateAvailable);
    assert_eq!(next.active_pair().unwrap(), Some(pair("v1")));

    next.skip_waiting().unwrap();

    assert_eq!(next.state(), Some(LifecycleState::Activated));
    assert_eq!(events.try_recv().unwrap(), LifecycleEvent::ControllerChange);
    let mut names = storage.keys().unwrap();
    names.sort();
    assert_eq!(names, vec!["dynamic-v2", "static-v2"]);
  }

  #[tokio::test]
  async fn test_waiting_state_survives_restart() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    manager(&storage, &network, "v1").install().await.unwrap();
    manager(&storage, &network, "v2").install().await.unwrap();

    let restarted = manager(&storage, &network, "v2");

    assert_eq!(restarted.state(), Some(LifecycleState::InstalledWaiting));
  }

  #[test]
  fn test_activate_without_waiting_generation_fails() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let lifecycle = manager(&storage, &network, "v1");

    assert!(lifecycle.activate().is_err());
    assert!(lifecycle.skip_waiting().is_ok());
    assert_eq!(lifecycle.state(), None);
  }
}
