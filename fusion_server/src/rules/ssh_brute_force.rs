//! Repeated SSH failures from one address followed by a success from the
//! same address.

use super::{incident_id, Incident, IncidentSeverity, Rule, RuleContext, MINUTE_NS};
use crate::view::{AuthResult, AuthType};
use std::collections::{BTreeMap, HashSet};

const FAILURE_LOOKBACK_NS: i64 = 30 * MINUTE_NS;
const MIN_FAILED_ATTEMPTS: usize = 3;

pub struct SshBruteForce;

impl Rule for SshBruteForce {
  fn name(&self) -> &'static str {
    "ssh_brute_force"
  }

  fn evaluate(&self, ctx: &RuleContext) -> Vec<Incident> {
    let mut incidents = Vec::new();
    let mut fired_ips: HashSet<&str> = HashSet::new();

    for event in ctx.events {
      let Some(security) = event.security() else {
        continue;
      };
      if security.auth_type != AuthType::Ssh
        || security.result != AuthResult::Success
        || security.source_ip.is_empty()
        || fired_ips.contains(security.source_ip.as_str())
      {
        continue;
      }

      // Failures from the same address in the half-hour before this login.
      let failures: Vec<_> = ctx
        .events
        .iter()
        .filter(|candidate| {
          candidate
            .security()
            .map(|s| {
              s.auth_type == AuthType::Ssh
                && s.result == AuthResult::Failure
                && s.source_ip == security.source_ip
            })
            .unwrap_or(false)
            && candidate.timestamp_ns < event.timestamp_ns
            && candidate.timestamp_ns >= event.timestamp_ns - FAILURE_LOOKBACK_NS
        })
        .collect();

      if failures.len() < MIN_FAILED_ATTEMPTS {
        continue;
      }

      // The earliest qualifying success per address is the terminal event;
      // the most recent failures before it are the smallest supporting set.
      fired_ips.insert(security.source_ip.as_str());
      let supporting = &failures[failures.len() - MIN_FAILED_ATTEMPTS..];

      let first_failure = supporting[0];
      let time_to_compromise_secs =
        (event.timestamp_ns - first_failure.timestamp_ns) / 1_000_000_000;

      let mut event_ids: Vec<String> =
        supporting.iter().map(|f| f.event_id.clone()).collect();
      event_ids.push(event.event_id.clone());

      let mut metadata = BTreeMap::new();
      metadata.insert("source_ip".to_string(), security.source_ip.clone());
      metadata.insert("target_user".to_string(), security.user.clone());
      metadata.insert(
        "failed_attempts".to_string(),
        supporting.len().to_string(),
      );
      metadata.insert(
        "time_to_compromise".to_string(),
        time_to_compromise_secs.to_string(),
      );

      incidents.push(Incident {
        incident_id: incident_id(self.name(), ctx.device_id, &event.event_id),
        device_id: ctx.device_id.to_string(),
        severity: IncidentSeverity::High,
        tactics: vec!["Initial Access".to_string()],
        techniques: vec!["T1110".to_string(), "T1021.004".to_string()],
        rule_name: self.name().to_string(),
        summary: format!(
          "SSH brute force from {}: {} failures then successful login as {}",
          security.source_ip,
          supporting.len(),
          security.user
        ),
        start_ts_ns: first_failure.timestamp_ns,
        end_ts_ns: event.timestamp_ns,
        event_ids,
        metadata,
      });
    }

    incidents
  }
}
