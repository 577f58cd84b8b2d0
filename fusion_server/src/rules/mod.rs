//! Correlation rules.
//!
//! Each rule is a pure function over one device's sorted window. Rules never
//! mutate events, never see each other's output within a tick, and are
//! evaluated in the fixed order returned by [`default_rules`]. Incident ids
//! are deterministic over `(rule_name, device_id, terminal_event_id)`, so a
//! rule firing again for the same terminal event is a no-op downstream.

mod multi_tactic;
mod persistence_after_auth;
mod ssh_brute_force;
mod suspicious_sudo;

pub use multi_tactic::MultiTacticAttack;
pub use persistence_after_auth::PersistenceAfterAuth;
pub use ssh_brute_force::SshBruteForce;
pub use suspicious_sudo::{matches_any_pattern as suspicious_sudo_matches, SuspiciousSudo};

use crate::config::RulesConfig;
use crate::view::TelemetryEventView;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const MINUTE_NS: i64 = 60 * 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IncidentSeverity {
  Info,
  Low,
  Medium,
  High,
  Critical,
}

impl IncidentSeverity {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Info => "INFO",
      Self::Low => "LOW",
      Self::Medium => "MEDIUM",
      Self::High => "HIGH",
      Self::Critical => "CRITICAL",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "CRITICAL" => Self::Critical,
      "HIGH" => Self::High,
      "MEDIUM" => Self::Medium,
      "LOW" => Self::Low,
      _ => Self::Info,
    }
  }
}

/// A correlated attack-chain record. Persisted once; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
  pub incident_id: String,
  pub device_id: String,
  pub severity: IncidentSeverity,
  pub tactics: Vec<String>,
  pub techniques: Vec<String>,
  pub rule_name: String,
  pub summary: String,
  pub start_ts_ns: i64,
  pub end_ts_ns: i64,
  pub event_ids: Vec<String>,
  pub metadata: BTreeMap<String, String>,
}

/// Deterministic incident identity: the same rule firing on the same
/// terminal event always produces the same id.
pub fn incident_id(rule_name: &str, device_id: &str, terminal_event_id: &str) -> String {
  let digest = Sha256::digest(format!("{}|{}|{}", rule_name, device_id, terminal_event_id));
  format!("inc_{}", &hex::encode(digest)[..32])
}

/// Everything a rule may look at for one evaluation.
pub struct RuleContext<'a> {
  pub device_id: &'a str,
  /// Window contents sorted by `(timestamp_ns, event_id)`.
  pub events: &'a [Arc<TelemetryEventView>],
  pub config: &'a RulesConfig,
}

pub trait Rule: Send + Sync {
  fn name(&self) -> &'static str;
  fn evaluate(&self, ctx: &RuleContext) -> Vec<Incident>;
}

/// The fixed rule list, in evaluation order.
pub fn default_rules() -> Vec<Box<dyn Rule>> {
  vec![
    Box::new(SshBruteForce),
    Box::new(PersistenceAfterAuth),
    Box::new(SuspiciousSudo),
    Box::new(MultiTacticAttack),
  ]
}
