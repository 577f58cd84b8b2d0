use crate::error::EnvelopeError;
use amoskys_protos::amoskys::v1::{envelope::Payload, Envelope};

/// Highest schema version this build understands.
pub const SUPPORTED_VERSION: u32 = 1;

/// Payload variant tag, used for metrics labels and store columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
  Flow,
  Process,
  Security,
  Audit,
  Metric,
}

impl PayloadKind {
  pub fn of(payload: &Payload) -> Self {
    match payload {
      Payload::FlowEvent(_) => Self::Flow,
      Payload::ProcessEvent(_) => Self::Process,
      Payload::SecurityEvent(_) => Self::Security,
      Payload::AuditEvent(_) => Self::Audit,
      Payload::MetricEvent(_) => Self::Metric,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Flow => "flow",
      Self::Process => "process",
      Self::Security => "security",
      Self::Audit => "audit",
      Self::Metric => "metric",
    }
  }
}

impl std::fmt::Display for PayloadKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Coarse severity attached to normalized event views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
  Info,
  Warn,
  Critical,
}

impl Severity {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Info => "INFO",
      Self::Warn => "WARN",
      Self::Critical => "CRITICAL",
    }
  }
}

/// Validate the envelope shape: supported version, identity fields present,
/// exactly one payload variant set, plausible capture timestamp.
///
/// Signature and trust checks are separate concerns; this only answers
/// whether the message is structurally acceptable.
pub fn schema_check(envelope: &Envelope) -> Result<(), EnvelopeError> {
  if envelope.version == 0 || envelope.version > SUPPORTED_VERSION {
    return Err(EnvelopeError::UnsupportedVersion(envelope.version));
  }

  if envelope.source_agent_id.is_empty() {
    return Err(EnvelopeError::MissingAgentId);
  }

  if envelope.event_id.is_empty() {
    return Err(EnvelopeError::MissingEventId);
  }

  if envelope.payload.is_none() {
    return Err(EnvelopeError::MissingPayload);
  }

  if envelope.timestamp_ns <= 0 {
    return Err(EnvelopeError::InvalidTimestamp(envelope.timestamp_ns));
  }

  Ok(())
}
