mod config;
mod error;
pub mod health;
pub mod observability;
pub mod service;
pub mod store;
pub mod tls;

pub use config::*;
pub use error::*;
pub use store::{EventStore, StoredEvent};

use amoskys_core::TrustMapHandle;
use dashmap::DashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

/// Consecutive store failures before readiness flips to false.
const STORE_FAILURE_THRESHOLD: u32 = 3;

#[derive(Clone)]
pub struct AppState {
  inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
  pub config: BusConfig,
  pub store: EventStore,
  pub trust: Arc<TrustMapHandle>,
  /// Event ids currently inside the publish pipeline.
  pub(crate) inflight: DashMap<String, ()>,
  /// Strict admission bound; one permit per publish in progress.
  pub(crate) admission: Arc<Semaphore>,
  pub(crate) overloaded: AtomicBool,
  pub(crate) ready: AtomicBool,
  pub(crate) store_failures: AtomicU32,
}

impl Deref for AppState {
  type Target = AppStateInner;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl AppState {
  pub async fn try_new(config: BusConfig) -> Result<Self, BusError> {
    if let Some(parent) = config.server.store_path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let store = EventStore::open(&config.server.store_path).await?;
    let trust = Arc::new(TrustMapHandle::load(&config.trust.trust_map_path)?);

    let admission = Arc::new(Semaphore::new(config.limits.max_inflight));
    let overloaded = AtomicBool::new(config.limits.overload_flag);

    info!(
      max_inflight = config.limits.max_inflight,
      trusted_agents = trust.snapshot().len(),
      "EventBus state initialized"
    );

    Ok(Self {
      inner: Arc::new(AppStateInner {
        config,
        store,
        trust,
        inflight: DashMap::new(),
        admission,
        overloaded,
        ready: AtomicBool::new(true),
        store_failures: AtomicU32::new(0),
      }),
    })
  }

  pub fn into_arc(self) -> Arc<Self> {
    Arc::new(self)
  }

  /// Operator control: while set, every publish is rejected with OVERLOAD
  /// before any validation work.
  pub fn set_overloaded(&self, on: bool) {
    self
      .overloaded
      .store(on, std::sync::atomic::Ordering::Release);
  }
}

impl std::fmt::Debug for AppStateInner {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AppStateInner")
      .field("config", &self.config)
      .field("inflight", &self.inflight.len())
      .finish()
  }
}
