//! Execution, command-and-control, and persistence inside one short window.

use super::{incident_id, Incident, IncidentSeverity, Rule, RuleContext, MINUTE_NS};
use crate::config::RulesConfig;
use crate::view::{AuditAction, TelemetryEventView};
use std::collections::BTreeMap;
use std::sync::Arc;

const SUB_WINDOW_NS: i64 = 15 * MINUTE_NS;

pub struct MultiTacticAttack;

fn is_suspicious_process(event: &TelemetryEventView, config: &RulesConfig) -> bool {
  let Some(process) = event.process() else {
    return false;
  };
  config
    .suspicious_process_prefixes
    .iter()
    .any(|prefix| process.executable_path.starts_with(prefix))
    || config
      .suspicious_process_markers
      .iter()
      .any(|marker| process.executable_path.contains(marker))
}

fn is_unwhitelisted_flow(event: &TelemetryEventView, config: &RulesConfig) -> bool {
  let Some(flow) = event.flow() else {
    return false;
  };
  let destination = format!("{}:{}", flow.dst_ip, flow.dst_port);
  !config.flow_whitelist.contains(&destination)
}

fn is_persistence_creation(event: &TelemetryEventView) -> bool {
  event
    .audit()
    .map(|a| a.action == AuditAction::Created && a.object_type.is_persistence())
    .unwrap_or(false)
}

impl Rule for MultiTacticAttack {
  fn name(&self) -> &'static str {
    "multi_tactic_attack"
  }

  fn evaluate(&self, ctx: &RuleContext) -> Vec<Incident> {
    // The earliest event that completes the triple is the terminal event;
    // one incident per evaluation is enough because the id is stable.
    for event in ctx.events {
      let window_start = event.timestamp_ns - SUB_WINDOW_NS;
      let in_sub_window = |candidate: &Arc<TelemetryEventView>| {
        candidate.timestamp_ns >= window_start && candidate.timestamp_ns <= event.timestamp_ns
      };

      let process = ctx
        .events
        .iter()
        .find(|c| in_sub_window(c) && is_suspicious_process(c, ctx.config));
      let flow = ctx
        .events
        .iter()
        .find(|c| in_sub_window(c) && is_unwhitelisted_flow(c, ctx.config));
      let persistence = ctx
        .events
        .iter()
        .find(|c| in_sub_window(c) && is_persistence_creation(c));

      let (Some(process), Some(flow), Some(persistence)) = (process, flow, persistence) else {
        continue;
      };

      let process_view = process.process().map(|p| p.executable_path.clone()).unwrap_or_default();
      let flow_view = flow
        .flow()
        .map(|f| format!("{}:{}", f.dst_ip, f.dst_port))
        .unwrap_or_default();
      let persistence_kind = persistence
        .audit()
        .map(|a| a.object_type.as_str().to_string())
        .unwrap_or_default();

      let start_ts_ns = process
        .timestamp_ns
        .min(flow.timestamp_ns)
        .min(persistence.timestamp_ns);

      let mut metadata = BTreeMap::new();
      metadata.insert("process_path".to_string(), process_view.clone());
      metadata.insert("destination".to_string(), flow_view.clone());
      metadata.insert("persistence_kind".to_string(), persistence_kind.clone());

      return vec![Incident {
        incident_id: incident_id(self.name(), ctx.device_id, &event.event_id),
        device_id: ctx.device_id.to_string(),
        severity: IncidentSeverity::Critical,
        tactics: vec![
          "Execution".to_string(),
          "Command and Control".to_string(),
          "Persistence".to_string(),
        ],
        techniques: vec![
          "T1059".to_string(),
          "T1071".to_string(),
          "T1543.001".to_string(),
        ],
        rule_name: self.name().to_string(),
        summary: format!(
          "Multi-tactic chain: {} executed, traffic to {}, {} created",
          process_view, flow_view, persistence_kind
        ),
        start_ts_ns,
        end_ts_ns: event.timestamp_ns,
        event_ids: vec![
          process.event_id.clone(),
          flow.event_id.clone(),
          persistence.event_id.clone(),
        ],
        metadata,
      }];
    }

    Vec::new()
  }
}

#[cfg(test)]
mod tests {
  use super::super::test_support::*;
  use super::*;
  use crate::view::ObjectKind;

  fn run_with(
    events: Vec<Arc<TelemetryEventView>>,
    config: RulesConfig,
  ) -> Vec<Incident> {
    let ctx = RuleContext {
      device_id: "d1",
      events: &events,
      config: &config,
    };
    MultiTacticAttack.evaluate(&ctx)
  }

  fn run(events: Vec<Arc<TelemetryEventView>>) -> Vec<Incident> {
    run_with(events, RulesConfig::default())
  }

  #[test]
  fn full_chain_inside_fifteen_minutes_fires_critical() {
    let incidents = run(vec![
      process_event("proc", 0, "/tmp/x"),
      flow_event("flow", 300, "198.51.100.9", 4444),
      audit_created("persist", 800, ObjectKind::LaunchAgent, "/Users/a/LaunchAgents/x.plist"),
    ]);

    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert_eq!(incident.severity, IncidentSeverity::Critical);
    assert_eq!(incident.metadata["process_path"], "/tmp/x");
    assert_eq!(incident.metadata["destination"], "198.51.100.9:4444");
    assert_eq!(incident.metadata["persistence_kind"], "LAUNCH_AGENT");
    assert_eq!(incident.event_ids.len(), 3);
  }

  #[test]
  fn chain_spread_beyond_fifteen_minutes_does_not_fire() {
    let incidents = run(vec![
      process_event("proc", 0, "/tmp/x"),
      flow_event("flow", 300, "198.51.100.9", 4444),
      audit_created("persist", 16 * 60, ObjectKind::LaunchAgent, "/tmp/x.plist"),
    ]);
    assert!(incidents.is_empty());
  }

  #[test]
  fn two_of_three_tactics_do_not_fire() {
    let incidents = run(vec![
      process_event("proc", 0, "/tmp/x"),
      flow_event("flow", 300, "198.51.100.9", 4444),
    ]);
    assert!(incidents.is_empty());
  }

  #[test]
  fn whitelisted_destination_breaks_the_chain() {
    let mut config = RulesConfig::default();
    config.flow_whitelist.push("198.51.100.9:4444".to_string());

    let incidents = run_with(
      vec![
        process_event("proc", 0, "/tmp/x"),
        flow_event("flow", 300, "198.51.100.9", 4444),
        audit_created("persist", 800, ObjectKind::LaunchAgent, "/tmp/x.plist"),
      ],
      config,
    );
    assert!(incidents.is_empty());
  }

  #[test]
  fn trusted_process_location_breaks_the_chain() {
    let incidents = run(vec![
      process_event("proc", 0, "/usr/bin/curl"),
      flow_event("flow", 300, "198.51.100.9", 443),
      audit_created("persist", 800, ObjectKind::Cron, "/var/at/tabs/root"),
    ]);
    assert!(incidents.is_empty());
  }

  #[test]
  fn downloads_marker_counts_as_suspicious() {
    let incidents = run(vec![
      process_event("proc", 0, "/Users/a/Downloads/payload"),
      flow_event("flow", 60, "198.51.100.9", 4444),
      audit_created("persist", 120, ObjectKind::SshKeys, "/Users/a/.ssh/authorized_keys"),
    ]);
    assert_eq!(incidents.len(), 1);
  }
}
