//! Persistence artifact created shortly after an interactive authentication.

use super::{incident_id, Incident, IncidentSeverity, Rule, RuleContext, MINUTE_NS};
use crate::view::{AuditAction, AuthResult, AuthType};
use std::collections::BTreeMap;

const AUTH_LOOKBACK_NS: i64 = 10 * MINUTE_NS;

pub struct PersistenceAfterAuth;

impl Rule for PersistenceAfterAuth {
  fn name(&self) -> &'static str {
    "persistence_after_auth"
  }

  fn evaluate(&self, ctx: &RuleContext) -> Vec<Incident> {
    let mut incidents = Vec::new();

    for event in ctx.events {
      let Some(audit) = event.audit() else {
        continue;
      };
      if audit.action != AuditAction::Created || !audit.object_type.is_persistence() {
        continue;
      }

      // The earliest interactive auth success inside the lookback keeps the
      // supporting set minimal and the incident id stable.
      let auth = ctx.events.iter().find(|candidate| {
        candidate
          .security()
          .map(|s| {
            matches!(s.auth_type, AuthType::Ssh | AuthType::Sudo)
              && s.result == AuthResult::Success
          })
          .unwrap_or(false)
          && candidate.timestamp_ns <= event.timestamp_ns
          && candidate.timestamp_ns >= event.timestamp_ns - AUTH_LOOKBACK_NS
      });

      let Some(auth) = auth else {
        continue;
      };
      let auth_view = auth.security().map(|s| s.user.clone()).unwrap_or_default();

      let severity = if audit.path.starts_with("/Users/") {
        IncidentSeverity::Critical
      } else {
        IncidentSeverity::High
      };

      let delta_seconds = (event.timestamp_ns - auth.timestamp_ns) / 1_000_000_000;

      let mut metadata = BTreeMap::new();
      metadata.insert("object_path".to_string(), audit.path.clone());
      metadata.insert("object_type".to_string(), audit.object_type.as_str().to_string());
      metadata.insert("auth_user".to_string(), auth_view.clone());
      metadata.insert("delta_seconds".to_string(), delta_seconds.to_string());

      incidents.push(Incident {
        incident_id: incident_id(self.name(), ctx.device_id, &event.event_id),
        device_id: ctx.device_id.to_string(),
        severity,
        tactics: vec!["Persistence".to_string()],
        techniques: vec![
          "T1543.001".to_string(),
          "T1543.004".to_string(),
          "T1053.003".to_string(),
          "T1098.004".to_string(),
        ],
        rule_name: self.name().to_string(),
        summary: format!(
          "{} created at {} within {}s of {} authenticating",
          audit.object_type.as_str(),
          audit.path,
          delta_seconds,
          auth_view
        ),
        start_ts_ns: auth.timestamp_ns,
        end_ts_ns: event.timestamp_ns,
        event_ids: vec![auth.event_id.clone(), event.event_id.clone()],
        metadata,
      });
    }

    incidents
  }
}

#[cfg(test)]
mod tests {
  use super::super::test_support::*;
  use super::*;
  use crate::config::RulesConfig;
  use crate::view::ObjectKind;

  fn run(events: Vec<std::sync::Arc<crate::view::TelemetryEventView>>) -> Vec<Incident> {
    let config = RulesConfig::default();
    let ctx = RuleContext {
      device_id: "d1",
      events: &events,
      config: &config,
    };
    PersistenceAfterAuth.evaluate(&ctx)
  }

  #[test]
  fn launch_agent_after_ssh_login_fires_critical_under_users() {
    let incidents = run(vec![
      ssh_success("auth", 0, "203.0.113.42", "alice"),
      audit_created(
        "persist",
        120,
        ObjectKind::LaunchAgent,
        "/Users/alice/Library/LaunchAgents/com.x.plist",
      ),
    ]);

    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert_eq!(incident.severity, IncidentSeverity::Critical);
    assert_eq!(incident.metadata["auth_user"], "alice");
    assert_eq!(incident.metadata["delta_seconds"], "120");
    assert_eq!(incident.event_ids, vec!["auth", "persist"]);
  }

  #[test]
  fn system_path_artifact_is_high_not_critical() {
    let incidents = run(vec![
      sudo_event("auth", 0, "root", "ls"),
      audit_created(
        "persist",
        60,
        ObjectKind::LaunchDaemon,
        "/Library/LaunchDaemons/com.x.plist",
      ),
    ]);

    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].severity, IncidentSeverity::High);
  }

  #[test]
  fn artifact_outside_the_ten_minute_window_does_not_fire() {
    let incidents = run(vec![
      ssh_success("auth", 0, "203.0.113.42", "alice"),
      audit_created(
        "persist",
        11 * 60,
        ObjectKind::SshKeys,
        "/Users/alice/.ssh/authorized_keys",
      ),
    ]);
    assert!(incidents.is_empty());
  }

  #[test]
  fn artifact_without_preceding_auth_does_not_fire() {
    let incidents = run(vec![audit_created(
      "persist",
      0,
      ObjectKind::Cron,
      "/var/at/tabs/root",
    )]);
    assert!(incidents.is_empty());
  }

  #[test]
  fn non_persistence_object_kinds_are_ignored() {
    let incidents = run(vec![
      ssh_success("auth", 0, "203.0.113.42", "alice"),
      audit_created("profile", 60, ObjectKind::ShellProfile, "/Users/alice/.zshrc"),
    ]);
    assert!(incidents.is_empty());
  }
}
