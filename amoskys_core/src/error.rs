use thiserror::Error;

/// Schema-level envelope rejection. Every variant maps to an INVALID ack on
/// the bus side; none of them are retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
  #[error("unsupported schema version: {0}")]
  UnsupportedVersion(u32),

  #[error("missing source agent id")]
  MissingAgentId,

  #[error("missing event id")]
  MissingEventId,

  #[error("missing payload variant")]
  MissingPayload,

  #[error("invalid timestamp: {0}")]
  InvalidTimestamp(i64),
}

#[derive(Error, Debug)]
pub enum CryptoError {
  #[error("invalid key format: {0}")]
  InvalidKeyFormat(String),

  #[error("signing failed: {0}")]
  SigningFailed(String),

  #[error("signature verification failed")]
  VerificationFailed,
}

#[derive(Error, Debug)]
pub enum TrustError {
  #[error("trust map io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("trust map parse error: {0}")]
  Parse(#[from] serde_yaml::Error),

  #[error("invalid trust entry for {agent_id}: {reason}")]
  InvalidEntry { agent_id: String, reason: String },

  #[error("unknown agent: {0}")]
  UnknownAgent(String),

  #[error("agent credentials expired: {0}")]
  Expired(String),
}
