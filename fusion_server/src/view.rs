//! Normalized in-memory projection of stored envelopes for correlation.

use crate::error::FusionError;
use amoskys_core::Severity;
use amoskys_protos::amoskys::v1::{
  audit_event, envelope::Payload, security_event, Envelope,
};
use eventbus_server::StoredEvent;
use prost::Message;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
  Security,
  Audit,
  Process,
  Flow,
  Metric,
}

impl EventType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Security => "SECURITY",
      Self::Audit => "AUDIT",
      Self::Process => "PROCESS",
      Self::Flow => "FLOW",
      Self::Metric => "METRIC",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthType {
  Ssh,
  Sudo,
  Login,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
  Success,
  Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
  Created,
  Modified,
  Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
  LaunchAgent,
  LaunchDaemon,
  Cron,
  SshKeys,
  ShellProfile,
}

impl ObjectKind {
  /// Kinds that count as persistence artifacts for correlation.
  pub fn is_persistence(&self) -> bool {
    matches!(
      self,
      Self::LaunchAgent | Self::LaunchDaemon | Self::Cron | Self::SshKeys
    )
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::LaunchAgent => "LAUNCH_AGENT",
      Self::LaunchDaemon => "LAUNCH_DAEMON",
      Self::Cron => "CRON",
      Self::SshKeys => "SSH_KEYS",
      Self::ShellProfile => "SHELL_PROFILE",
    }
  }
}

#[derive(Debug, Clone)]
pub struct SecurityView {
  pub auth_type: AuthType,
  pub result: AuthResult,
  pub user: String,
  pub source_ip: String,
  pub sudo_command: String,
}

#[derive(Debug, Clone)]
pub struct AuditView {
  pub action: AuditAction,
  pub object_type: ObjectKind,
  pub path: String,
}

#[derive(Debug, Clone)]
pub struct ProcessView {
  pub pid: i64,
  pub executable_path: String,
  pub command_line: String,
}

#[derive(Debug, Clone)]
pub struct FlowView {
  pub src_ip: String,
  pub dst_ip: String,
  pub dst_port: u32,
  pub protocol: String,
}

#[derive(Debug, Clone)]
pub struct MetricView {
  pub name: String,
  pub value: f64,
}

#[derive(Debug, Clone)]
pub enum EventBody {
  Security(SecurityView),
  Audit(AuditView),
  Process(ProcessView),
  Flow(FlowView),
  Metric(MetricView),
}

#[derive(Debug, Clone)]
pub struct TelemetryEventView {
  pub event_id: String,
  pub device_id: String,
  pub event_type: EventType,
  pub severity: Severity,
  pub timestamp_ns: i64,
  pub body: EventBody,
  pub attributes: HashMap<String, String>,
  pub skew_flagged: bool,
}

impl TelemetryEventView {
  pub fn security(&self) -> Option<&SecurityView> {
    match &self.body {
      EventBody::Security(view) => Some(view),
      _ => None,
    }
  }

  pub fn audit(&self) -> Option<&AuditView> {
    match &self.body {
      EventBody::Audit(view) => Some(view),
      _ => None,
    }
  }

  pub fn process(&self) -> Option<&ProcessView> {
    match &self.body {
      EventBody::Process(view) => Some(view),
      _ => None,
    }
  }

  pub fn flow(&self) -> Option<&FlowView> {
    match &self.body {
      EventBody::Flow(view) => Some(view),
      _ => None,
    }
  }

  /// Build a view from a stored row, decoding the original envelope.
  pub fn from_stored(stored: &StoredEvent) -> Result<Self, FusionError> {
    let envelope = Envelope::decode(stored.envelope.as_slice())?;
    Self::from_envelope(&envelope, stored.skew_flagged)
  }

  pub fn from_envelope(envelope: &Envelope, skew_flagged: bool) -> Result<Self, FusionError> {
    let payload = envelope
      .payload
      .as_ref()
      .ok_or_else(|| FusionError::Config("envelope without payload".to_string()))?;

    let (event_type, severity, body) = match payload {
      Payload::SecurityEvent(e) => {
        let auth_type = match security_event::AuthType::try_from(e.auth_type) {
          Ok(security_event::AuthType::Ssh) => AuthType::Ssh,
          Ok(security_event::AuthType::Sudo) => AuthType::Sudo,
          _ => AuthType::Login,
        };
        let result = match security_event::AuthResult::try_from(e.result) {
          Ok(security_event::AuthResult::Success) => AuthResult::Success,
          _ => AuthResult::Failure,
        };
        let severity = if result == AuthResult::Failure {
          Severity::Warn
        } else {
          Severity::Info
        };
        (
          EventType::Security,
          severity,
          EventBody::Security(SecurityView {
            auth_type,
            result,
            user: e.user.clone(),
            source_ip: e.source_ip.clone(),
            sudo_command: e.sudo_command.clone(),
          }),
        )
      }
      Payload::AuditEvent(e) => {
        let action = match audit_event::Action::try_from(e.action) {
          Ok(audit_event::Action::Created) => AuditAction::Created,
          Ok(audit_event::Action::Modified) => AuditAction::Modified,
          _ => AuditAction::Deleted,
        };
        let object_type = match audit_event::ObjectType::try_from(e.object_type) {
          Ok(audit_event::ObjectType::LaunchAgent) => ObjectKind::LaunchAgent,
          Ok(audit_event::ObjectType::LaunchDaemon) => ObjectKind::LaunchDaemon,
          Ok(audit_event::ObjectType::Cron) => ObjectKind::Cron,
          Ok(audit_event::ObjectType::SshKeys) => ObjectKind::SshKeys,
          _ => ObjectKind::ShellProfile,
        };
        let severity = if action == AuditAction::Created && object_type.is_persistence() {
          Severity::Warn
        } else {
          Severity::Info
        };
        (
          EventType::Audit,
          severity,
          EventBody::Audit(AuditView {
            action,
            object_type,
            path: e.path.clone(),
          }),
        )
      }
      Payload::ProcessEvent(e) => (
        EventType::Process,
        Severity::Info,
        EventBody::Process(ProcessView {
          pid: e.pid,
          executable_path: e.executable_path.clone(),
          command_line: e.command_line.clone(),
        }),
      ),
      Payload::FlowEvent(e) => (
        EventType::Flow,
        Severity::Info,
        EventBody::Flow(FlowView {
          src_ip: e.src_ip.clone(),
          dst_ip: e.dst_ip.clone(),
          dst_port: e.dst_port,
          protocol: e.protocol.clone(),
        }),
      ),
      Payload::MetricEvent(e) => (
        EventType::Metric,
        Severity::Info,
        EventBody::Metric(MetricView {
          name: e.name.clone(),
          value: e.value,
        }),
      ),
    };

    Ok(Self {
      event_id: envelope.event_id.clone(),
      device_id: envelope.source_agent_id.clone(),
      event_type,
      severity,
      timestamp_ns: envelope.timestamp_ns,
      body,
      attributes: envelope.attributes.clone(),
      skew_flagged,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use amoskys_protos::amoskys::v1::{AuditEvent, SecurityEvent};

  fn envelope_with(payload: Payload) -> Envelope {
    Envelope {
      version: 1,
      source_agent_id: "d1".to_string(),
      event_id: "evt-1".to_string(),
      timestamp_ns: 1_000,
      payload: Some(payload),
      attributes: Default::default(),
      signature: Vec::new(),
    }
  }

  #[test]
  fn failed_auth_normalizes_to_warn_security() {
    let envelope = envelope_with(Payload::SecurityEvent(SecurityEvent {
      auth_type: security_event::AuthType::Ssh as i32,
      result: security_event::AuthResult::Failure as i32,
      user: "admin".to_string(),
      source_ip: "203.0.113.42".to_string(),
      sudo_command: String::new(),
    }));

    let view = TelemetryEventView::from_envelope(&envelope, false).unwrap();
    assert_eq!(view.event_type, EventType::Security);
    assert_eq!(view.severity, Severity::Warn);

    let security = view.security().unwrap();
    assert_eq!(security.auth_type, AuthType::Ssh);
    assert_eq!(security.result, AuthResult::Failure);
  }

  #[test]
  fn created_persistence_artifact_normalizes_to_warn_audit() {
    let envelope = envelope_with(Payload::AuditEvent(AuditEvent {
      action: audit_event::Action::Created as i32,
      object_type: audit_event::ObjectType::LaunchAgent as i32,
      path: "/Users/alice/Library/LaunchAgents/com.x.plist".to_string(),
    }));

    let view = TelemetryEventView::from_envelope(&envelope, false).unwrap();
    assert_eq!(view.event_type, EventType::Audit);
    assert_eq!(view.severity, Severity::Warn);
    assert!(view.audit().unwrap().object_type.is_persistence());
  }

  #[test]
  fn payloadless_envelope_is_rejected() {
    let mut envelope = envelope_with(Payload::SecurityEvent(Default::default()));
    envelope.payload = None;
    assert!(TelemetryEventView::from_envelope(&envelope, false).is_err());
  }
}
