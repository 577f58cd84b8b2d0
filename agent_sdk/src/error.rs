use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
  #[error("wal database error: {0}")]
  Sqlx(#[from] sqlx::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("signing error: {0}")]
  Crypto(#[from] amoskys_core::CryptoError),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("wal is at high water and the drop policy is active")]
  HighWaterDropped,

  #[error("envelope decode error: {0}")]
  Decode(#[from] prost::DecodeError),

  #[error("transport error: {0}")]
  Transport(String),
}

impl AgentError {
  /// Whether retrying the same operation can ever succeed. Non-retryable
  /// publish failures are dead-lettered, mirroring how the bus answers
  /// INVALID for permanent rejections.
  pub fn is_retryable(&self) -> bool {
    match self {
      AgentError::Sqlx(_) | AgentError::Io(_) | AgentError::Transport(_) => true,
      AgentError::Crypto(_)
      | AgentError::Config(_)
      | AgentError::HighWaterDropped
      | AgentError::Decode(_) => false,
    }
  }
}
