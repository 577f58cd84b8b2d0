//! The fusion engine proper and its driver loop.
//!
//! The engine owns the per-device windows, the rule list, and the risk
//! scorer; it is single-threaded and purely in-memory. The driver wraps it
//! with the event-store poller, the ingest mailbox, the evaluation tick, and
//! persistence. A rule that panics is caught, counted, and skipped for the
//! tick; the other rules still run.

use crate::config::FusionConfig;
use crate::error::FusionError;
use crate::risk::{DeviceRiskSnapshot, RiskScorer};
use crate::rules::{default_rules, Incident, Rule, RuleContext};
use crate::store::FusionStore;
use crate::view::TelemetryEventView;
use crate::window::DeviceWindow;
use eventbus_server::EventStore;
use metrics::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

pub struct FusionEngine {
  windows: HashMap<String, DeviceWindow>,
  dirty: HashSet<String>,
  rules: Vec<Box<dyn Rule>>,
  scorer: RiskScorer,
  config: FusionConfig,
  window_ns: i64,
}

impl FusionEngine {
  pub fn new(config: FusionConfig) -> Self {
    let window_ns = config.window_ns();
    Self {
      windows: HashMap::new(),
      dirty: HashSet::new(),
      rules: default_rules(),
      scorer: RiskScorer::new(),
      config,
      window_ns,
    }
  }

  /// Add one event to its device window. Cheap and synchronous.
  pub fn ingest(&mut self, view: TelemetryEventView, now_ns: i64) {
    counter!("events_ingested_total", "event_type" => view.event_type.as_str()).increment(1);

    let device_id = view.device_id.clone();
    let window = self
      .windows
      .entry(device_id.clone())
      .or_insert_with(|| DeviceWindow::new(self.window_ns, self.config.engine.per_device_event_cap));
    window.push(Arc::new(view), now_ns);

    gauge!("window_size_events", "device" => device_id.clone()).set(window.len() as f64);
    self.dirty.insert(device_id);
  }

  /// Run every rule over the device's current window and compute the risk
  /// snapshot. Re-running over an unchanged window returns the same
  /// incident ids, which makes replay after a crash safe.
  pub fn evaluate(
    &mut self,
    device_id: &str,
    now_ns: i64,
  ) -> (Vec<Incident>, DeviceRiskSnapshot) {
    let events = match self.windows.get_mut(device_id) {
      Some(window) => {
        window.trim(now_ns);
        gauge!("window_size_events", "device" => device_id.to_string())
          .set(window.len() as f64);
        window.sorted_events()
      }
      None => Vec::new(),
    };

    let ctx = RuleContext {
      device_id,
      events: &events,
      config: &self.config.rules,
    };

    let mut incidents = Vec::new();
    for rule in &self.rules {
      counter!("rule_evaluations_total", "rule" => rule.name()).increment(1);

      match std::panic::catch_unwind(AssertUnwindSafe(|| rule.evaluate(&ctx))) {
        Ok(found) => incidents.extend(found),
        Err(_) => {
          counter!("rule_errors_total", "rule" => rule.name()).increment(1);
          error!(rule = rule.name(), device_id, "Rule panicked; skipping for this tick");
        }
      }
    }

    self.scorer.note_incidents(device_id, &incidents);
    let snapshot = self.scorer.score(device_id, &events, self.window_ns, now_ns);

    (incidents, snapshot)
  }

  /// Devices with activity since the last tick.
  pub fn take_dirty(&mut self) -> Vec<String> {
    let mut devices: Vec<String> = self.dirty.drain().collect();
    devices.sort();
    devices
  }

  pub fn mark_dirty(&mut self, device_id: &str) {
    self.dirty.insert(device_id.to_string());
  }
}

/// Owns the engine and wires it to storage: polls the event store into the
/// ingest mailbox, drains the mailbox, ticks evaluation, persists results.
pub struct FusionDriver {
  engine: FusionEngine,
  store: FusionStore,
  event_store: EventStore,
  mailbox_tx: mpsc::Sender<TelemetryEventView>,
  mailbox_rx: mpsc::Receiver<TelemetryEventView>,
  last_rowid: i64,
  poll_batch: i64,
  poll_interval: Duration,
  eval_interval: Duration,
  window_ns: i64,
}

impl FusionDriver {
  pub async fn new(config: FusionConfig) -> Result<Self, FusionError> {
    let store = FusionStore::open(&config.engine.db_path).await?;
    let event_store = EventStore::open(&config.engine.event_store_path).await?;
    let (mailbox_tx, mailbox_rx) = mpsc::channel(config.engine.mailbox_capacity);

    let poll_batch = config.engine.poll_batch;
    let poll_interval = Duration::from_millis(config.engine.poll_interval_ms);
    let eval_interval = Duration::from_secs(config.engine.eval_interval_seconds);
    let window_ns = config.window_ns();

    Ok(Self {
      engine: FusionEngine::new(config),
      store,
      event_store,
      mailbox_tx,
      mailbox_rx,
      last_rowid: 0,
      poll_batch,
      poll_interval,
      eval_interval,
      window_ns,
    })
  }

  /// External ingest endpoint: senders enqueue, the driver drains.
  pub fn ingest_sender(&self) -> mpsc::Sender<TelemetryEventView> {
    self.mailbox_tx.clone()
  }

  pub fn store(&self) -> &FusionStore {
    &self.store
  }

  pub fn event_store(&self) -> &EventStore {
    &self.event_store
  }

  /// Rebuild the in-memory windows from the last window of stored events.
  /// A crash therefore loses no incident that is still derivable.
  pub async fn replay(&mut self) -> Result<usize, FusionError> {
    let now_ns = now_ns();
    let stored = self.event_store.events_since(now_ns - self.window_ns).await?;
    let mut replayed = 0;

    for event in &stored {
      self.last_rowid = self.last_rowid.max(event.rowid);
      match TelemetryEventView::from_stored(event) {
        Ok(view) => {
          self.engine.ingest(view, now_ns);
          replayed += 1;
        }
        Err(e) => warn!(event_id = %event.event_id, "Skipping undecodable stored event: {}", e),
      }
    }

    info!(replayed, "Replayed event window from store");
    Ok(replayed)
  }

  pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
    if let Err(e) = self.replay().await {
      warn!("Window replay failed, starting with empty windows: {}", e);
    }

    let mut eval_ticker = tokio::time::interval(self.eval_interval);
    let mut poll_ticker = tokio::time::interval(self.poll_interval);
    info!("Fusion driver started");

    loop {
      tokio::select! {
        _ = shutdown.recv() => {
          // Partial tick state is discarded; the next run recomputes.
          info!("Fusion driver stopped");
          return;
        }
        _ = eval_ticker.tick() => {
          self.tick().await;
        }
        _ = poll_ticker.tick() => {
          if let Err(e) = self.poll_store().await {
            warn!("Event store poll failed: {}", e);
          }
        }
        Some(view) = self.mailbox_rx.recv() => {
          self.engine.ingest(view, now_ns());
        }
      }
    }
  }

  /// Pull newly appended events into the mailbox. `try_send` keeps the
  /// bounded mailbox as genuine backpressure: a full mailbox pauses the
  /// poll, not the bus.
  async fn poll_store(&mut self) -> Result<(), FusionError> {
    let batch = self
      .event_store
      .events_after(self.last_rowid, self.poll_batch)
      .await?;

    for event in &batch {
      let view = match TelemetryEventView::from_stored(event) {
        Ok(view) => view,
        Err(e) => {
          warn!(event_id = %event.event_id, "Skipping undecodable stored event: {}", e);
          self.last_rowid = self.last_rowid.max(event.rowid);
          continue;
        }
      };

      match self.mailbox_tx.try_send(view) {
        Ok(()) => self.last_rowid = self.last_rowid.max(event.rowid),
        Err(mpsc::error::TrySendError::Full(_)) => break,
        Err(mpsc::error::TrySendError::Closed(_)) => break,
      }
    }

    Ok(())
  }

  /// Evaluate every device with activity since the last tick and persist
  /// the results. Persistence failures re-mark the device dirty so the next
  /// tick retries; the in-memory window keeps advancing regardless.
  async fn tick(&mut self) {
    let now_ns = now_ns();

    for device_id in self.engine.take_dirty() {
      let (incidents, snapshot) = self.engine.evaluate(&device_id, now_ns);

      for incident in &incidents {
        match self.store.insert_incident(incident).await {
          Ok(true) => {
            counter!(
              "incidents_emitted_total",
              "rule" => incident.rule_name.clone(),
              "severity" => incident.severity.as_str()
            )
            .increment(1);
            info!(
              incident_id = %incident.incident_id,
              rule = %incident.rule_name,
              severity = incident.severity.as_str(),
              device_id = %incident.device_id,
              "Incident emitted"
            );
          }
          Ok(false) => {
            debug!(incident_id = %incident.incident_id, "Incident already recorded");
          }
          Err(e) => {
            warn!(incident_id = %incident.incident_id, "Incident persist failed, will retry: {}", e);
            self.engine.mark_dirty(&device_id);
          }
        }
      }

      if let Err(e) = self.store.upsert_risk(&snapshot).await {
        warn!(device_id = %device_id, "Risk persist failed, will retry: {}", e);
        self.engine.mark_dirty(&device_id);
      }
    }
  }
}

fn now_ns() -> i64 {
  chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::FusionConfig;
  use crate::rules::test_support::*;

  fn config() -> FusionConfig {
    serde_yaml::from_str(
      r#"
engine:
  db_path: "unused.db"
  event_store_path: "unused-events.db"
"#,
    )
    .unwrap()
  }

  #[test]
  fn ingest_marks_devices_dirty_once() {
    let mut engine = FusionEngine::new(config());
    engine.ingest(
      (*ssh_failure("f1", 0, "203.0.113.42", "admin")).clone(),
      at_secs(0),
    );
    engine.ingest(
      (*ssh_failure("f2", 1, "203.0.113.42", "admin")).clone(),
      at_secs(1),
    );

    assert_eq!(engine.take_dirty(), vec!["d1".to_string()]);
    assert!(engine.take_dirty().is_empty());
  }

  #[test]
  fn evaluate_on_unknown_device_returns_empty() {
    let mut engine = FusionEngine::new(config());
    let (incidents, snapshot) = engine.evaluate("ghost", at_secs(0));
    assert!(incidents.is_empty());
    assert_eq!(snapshot.score, 0);
  }

  #[test]
  fn window_trim_keeps_rules_away_from_stale_events() {
    let mut engine = FusionEngine::new(config());
    for (i, ts) in [0, 60, 120].iter().enumerate() {
      engine.ingest(
        (*ssh_failure(&format!("f{}", i), *ts, "203.0.113.42", "admin")).clone(),
        at_secs(*ts),
      );
    }
    engine.ingest(
      (*ssh_success("s1", 180, "203.0.113.42", "admin")).clone(),
      at_secs(180),
    );

    // Evaluated fresh, the brute-force rule fires.
    let (incidents, _) = engine.evaluate("d1", at_secs(200));
    assert_eq!(incidents.len(), 1);

    // 31 minutes later the whole chain is outside the window.
    engine.mark_dirty("d1");
    let (incidents, snapshot) = engine.evaluate("d1", at_secs(200 + 31 * 60));
    assert!(incidents.is_empty());
    assert_eq!(snapshot.score, 0);
  }
}
