//! Per-device sliding window of recent events.

use crate::view::TelemetryEventView;
use metrics::counter;
use std::collections::VecDeque;
use std::sync::Arc;

/// Time-bounded, count-capped ring of one device's events. Events are kept
/// in arrival order; rules sort by timestamp themselves where it matters.
#[derive(Debug)]
pub struct DeviceWindow {
  events: VecDeque<Arc<TelemetryEventView>>,
  window_ns: i64,
  cap: usize,
}

impl DeviceWindow {
  pub fn new(window_ns: i64, cap: usize) -> Self {
    Self {
      events: VecDeque::new(),
      window_ns,
      cap,
    }
  }

  pub fn push(&mut self, event: Arc<TelemetryEventView>, now_ns: i64) {
    self.trim(now_ns);
    if self.events.len() >= self.cap {
      // Overflow drops the oldest; loud, because rules lose history.
      self.events.pop_front();
      counter!("window_overflow_drops_total").increment(1);
    }
    self.events.push_back(event);
  }

  /// Drop events older than the window. Called on ingest and evaluation so
  /// rules never see anything stale.
  pub fn trim(&mut self, now_ns: i64) {
    let cutoff = now_ns - self.window_ns;
    while let Some(front) = self.events.front() {
      if front.timestamp_ns < cutoff {
        self.events.pop_front();
      } else {
        break;
      }
    }
  }

  /// Events sorted by capture timestamp, ready for rule evaluation.
  pub fn sorted_events(&self) -> Vec<Arc<TelemetryEventView>> {
    let mut events: Vec<_> = self.events.iter().cloned().collect();
    events.sort_by_key(|e| (e.timestamp_ns, e.event_id.clone()));
    events
  }

  pub fn len(&self) -> usize {
    self.events.len()
  }

  pub fn is_empty(&self) -> bool {
    self.events.is_empty()
  }
}
