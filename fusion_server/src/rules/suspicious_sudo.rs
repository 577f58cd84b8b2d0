//! Sudo invocations matching a fixed set of dangerous command patterns.

use super::{incident_id, Incident, IncidentSeverity, Rule, RuleContext};
use crate::view::AuthType;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternClass {
  /// Sudoers tampering, kernel extension loads, outright system destruction.
  A,
  /// Destructive operations on system paths, launchd service writes.
  B,
}

struct SudoPattern {
  name: &'static str,
  class: PatternClass,
  matches: fn(&str) -> bool,
}

const PATTERNS: &[SudoPattern] = &[
  SudoPattern {
    name: "sudoers_edit",
    class: PatternClass::A,
    matches: |cmd| cmd.contains("/etc/sudoers") || cmd.starts_with("visudo"),
  },
  SudoPattern {
    name: "kernel_extension_load",
    class: PatternClass::A,
    matches: |cmd| cmd.contains("kextload") || cmd.contains("kmutil load"),
  },
  SudoPattern {
    name: "system_destruction",
    class: PatternClass::A,
    matches: |cmd| {
      if cmd.contains("mkfs") || cmd.contains("of=/dev/") {
        return true;
      }
      // "rm -rf /" aimed at the root itself, not a subtree.
      match cmd.find("rm -rf /") {
        Some(pos) => {
          let rest = &cmd[pos + "rm -rf /".len()..];
          rest.is_empty() || rest.starts_with(' ') || rest.starts_with('*')
        }
        None => false,
      }
    },
  },
  SudoPattern {
    name: "destructive_system_path",
    class: PatternClass::B,
    matches: |cmd| {
      ["/System/", "/usr/", "/etc/", "/var/", "/bin/", "/sbin/"]
        .iter()
        .any(|root| cmd.contains(&format!("rm -rf {}", root)))
    },
  },
  SudoPattern {
    name: "launchd_service_write",
    class: PatternClass::B,
    matches: |cmd| cmd.contains("/Library/LaunchDaemons") || cmd.contains("/Library/LaunchAgents"),
  },
];

pub struct SuspiciousSudo;

impl Rule for SuspiciousSudo {
  fn name(&self) -> &'static str {
    "suspicious_sudo"
  }

  fn evaluate(&self, ctx: &RuleContext) -> Vec<Incident> {
    let mut incidents = Vec::new();

    for event in ctx.events {
      let Some(security) = event.security() else {
        continue;
      };
      if security.auth_type != AuthType::Sudo || security.sudo_command.is_empty() {
        continue;
      }

      let Some(pattern) = PATTERNS.iter().find(|p| (p.matches)(&security.sudo_command))
      else {
        continue;
      };

      let severity = match pattern.class {
        PatternClass::A => IncidentSeverity::Critical,
        PatternClass::B => IncidentSeverity::High,
      };

      let mut metadata = BTreeMap::new();
      metadata.insert("pattern".to_string(), pattern.name.to_string());
      metadata.insert("command".to_string(), security.sudo_command.clone());
      metadata.insert("user".to_string(), security.user.clone());

      incidents.push(Incident {
        incident_id: incident_id(self.name(), ctx.device_id, &event.event_id),
        device_id: ctx.device_id.to_string(),
        severity,
        tactics: vec!["Privilege Escalation".to_string()],
        techniques: vec!["T1548.003".to_string()],
        rule_name: self.name().to_string(),
        summary: format!(
          "Suspicious sudo by {} matched {}: {}",
          security.user, pattern.name, security.sudo_command
        ),
        start_ts_ns: event.timestamp_ns,
        end_ts_ns: event.timestamp_ns,
        event_ids: vec![event.event_id.clone()],
        metadata,
      });
    }

    incidents
  }
}

/// Whether a sudo command would fire this rule at all. The risk scorer uses
/// this to keep the contribution active while the event stays in the window.
pub fn matches_any_pattern(command: &str) -> bool {
  PATTERNS.iter().any(|p| (p.matches)(command))
}
