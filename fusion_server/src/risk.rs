//! Per-device risk scoring.
//!
//! The score is recomputed from the current window on every evaluation:
//! additive contributions for the signals below, minus idle decay, clamped
//! to [0, 100]. Cross-evaluation state is limited to which source addresses
//! have logged in before and which incidents were emitted, both keyed so a
//! contribution stays active exactly as long as its terminal event remains
//! inside the window.

use crate::rules::{Incident, IncidentSeverity, MINUTE_NS};
use crate::view::{AuditAction, AuthResult, AuthType, ObjectKind, TelemetryEventView};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const BASE_SCORE: i64 = 10;
const FAILED_SSH_STEP: i64 = 5;
const FAILED_SSH_CAP: i64 = 20;
const NEW_SOURCE_IP: i64 = 15;
const NEW_SSH_KEY: i64 = 30;
const USER_LAUNCH_AGENT: i64 = 25;
const SUSPICIOUS_SUDO: i64 = 30;
const INCIDENT_HIGH: i64 = 20;
const INCIDENT_CRITICAL: i64 = 40;
const DECAY_PER_IDLE_PERIOD: i64 = 10;
const IDLE_PERIOD_NS: i64 = 10 * MINUTE_NS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
  Low,
  Medium,
  High,
  Critical,
}

impl RiskLevel {
  pub fn from_score(score: u8) -> Self {
    match score {
      0..=30 => Self::Low,
      31..=60 => Self::Medium,
      61..=80 => Self::High,
      _ => Self::Critical,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
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
      _ => Self::Low,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRiskSnapshot {
  pub device_id: String,
  pub score: u8,
  pub level: RiskLevel,
  pub reason_tags: Vec<String>,
  pub supporting_events: Vec<String>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct EmittedIncident {
  severity: IncidentSeverity,
  end_ts_ns: i64,
}

/// Cross-evaluation memory and the scoring routine.
#[derive(Debug, Default)]
pub struct RiskScorer {
  /// device -> source_ip -> event id of the first successful login seen.
  first_success: HashMap<String, HashMap<String, String>>,
  /// device -> incident_id -> emission record.
  incidents: HashMap<String, HashMap<String, EmittedIncident>>,
}

impl RiskScorer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record incidents the rules produced so they contribute to the score
  /// while their terminal event stays in the window. Re-noting the same
  /// incident id is a no-op.
  pub fn note_incidents(&mut self, device_id: &str, incidents: &[Incident]) {
    let known = self.incidents.entry(device_id.to_string()).or_default();
    for incident in incidents {
      known
        .entry(incident.incident_id.clone())
        .or_insert(EmittedIncident {
          severity: incident.severity,
          end_ts_ns: incident.end_ts_ns,
        });
    }
  }

  pub fn score(
    &mut self,
    device_id: &str,
    events: &[Arc<TelemetryEventView>],
    window_ns: i64,
    now_ns: i64,
  ) -> DeviceRiskSnapshot {
    let mut score: i64 = 0;
    let mut tags: Vec<String> = Vec::new();
    let mut supporting: Vec<String> = Vec::new();
    let mut last_contribution_ns: i64 = 0;

    if !events.is_empty() {
      score += BASE_SCORE;
      tags.push("baseline_activity".to_string());
    }

    // Failed SSH attempts, capped.
    let failures: Vec<_> = events
      .iter()
      .filter(|e| {
        e.security()
          .map(|s| s.auth_type == AuthType::Ssh && s.result == AuthResult::Failure)
          .unwrap_or(false)
      })
      .collect();
    if !failures.is_empty() {
      score += (FAILED_SSH_STEP * failures.len() as i64).min(FAILED_SSH_CAP);
      tags.push(format!("ssh_failed_attempts_{}", failures.len()));
      for failure in &failures {
        supporting.push(failure.event_id.clone());
        last_contribution_ns = last_contribution_ns.max(failure.timestamp_ns);
      }
    }

    // First successful SSH login per source address. The contribution stays
    // attached to the event that introduced the address.
    let first_success = self.first_success.entry(device_id.to_string()).or_default();
    let mut seen_new_ips: HashSet<String> = HashSet::new();
    for event in events {
      let Some(security) = event.security() else {
        continue;
      };
      if security.auth_type != AuthType::Ssh
        || security.result != AuthResult::Success
        || security.source_ip.is_empty()
      {
        continue;
      }

      let origin = first_success
        .entry(security.source_ip.clone())
        .or_insert_with(|| event.event_id.clone());
      if *origin == event.event_id && seen_new_ips.insert(security.source_ip.clone()) {
        score += NEW_SOURCE_IP;
        tags.push(format!("new_ssh_source_{}", security.source_ip));
        supporting.push(event.event_id.clone());
        last_contribution_ns = last_contribution_ns.max(event.timestamp_ns);
      }
    }

    // Persistence artifacts.
    for event in events {
      let Some(audit) = event.audit() else {
        continue;
      };
      if audit.action != AuditAction::Created {
        continue;
      }
      match audit.object_type {
        ObjectKind::SshKeys => {
          score += NEW_SSH_KEY;
          tags.push("new_ssh_key_file".to_string());
          supporting.push(event.event_id.clone());
          last_contribution_ns = last_contribution_ns.max(event.timestamp_ns);
        }
        ObjectKind::LaunchAgent if audit.path.starts_with("/Users/") => {
          score += USER_LAUNCH_AGENT;
          tags.push("user_launch_agent".to_string());
          supporting.push(event.event_id.clone());
          last_contribution_ns = last_contribution_ns.max(event.timestamp_ns);
        }
        _ => {}
      }
    }

    // Suspicious sudo commands still in the window.
    let suspicious_sudo = events.iter().find(|e| {
      e.security()
        .map(|s| {
          s.auth_type == AuthType::Sudo
            && crate::rules::suspicious_sudo_matches(&s.sudo_command)
        })
        .unwrap_or(false)
    });
    if let Some(event) = suspicious_sudo {
      score += SUSPICIOUS_SUDO;
      tags.push("suspicious_sudo".to_string());
      supporting.push(event.event_id.clone());
      last_contribution_ns = last_contribution_ns.max(event.timestamp_ns);
    }

    // Incidents whose terminal event is still inside the window.
    if let Some(known) = self.incidents.get(device_id) {
      let cutoff = now_ns - window_ns;
      for incident in known.values() {
        if incident.end_ts_ns < cutoff {
          continue;
        }
        match incident.severity {
          IncidentSeverity::Critical => {
            score += INCIDENT_CRITICAL;
            tags.push("incident_critical".to_string());
          }
          IncidentSeverity::High => {
            score += INCIDENT_HIGH;
            tags.push("incident_high".to_string());
          }
          _ => continue,
        }
        last_contribution_ns = last_contribution_ns.max(incident.end_ts_ns);
      }
    }

    // Idle decay since the last contributing signal.
    if last_contribution_ns > 0 && now_ns > last_contribution_ns {
      let idle_periods = (now_ns - last_contribution_ns) / IDLE_PERIOD_NS;
      if idle_periods > 0 {
        score -= DECAY_PER_IDLE_PERIOD * idle_periods;
        tags.push(format!("idle_decay_{}", idle_periods));
      }
    }

    let score = score.clamp(0, 100) as u8;
    supporting.sort();
    supporting.dedup();

    DeviceRiskSnapshot {
      device_id: device_id.to_string(),
      score,
      level: RiskLevel::from_score(score),
      reason_tags: tags,
      supporting_events: supporting,
      updated_at: Utc::now(),
    }
  }
}
