use thiserror::Error;

#[derive(Error, Debug)]
pub enum FusionError {
  #[error("database error: {0}")]
  Sqlx(#[from] sqlx::Error),

  #[error("event store error: {0}")]
  EventStore(#[from] eventbus_server::BusError),

  #[error("envelope decode error: {0}")]
  Decode(#[from] prost::DecodeError),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("serialization error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("general error: {0}")]
  Any(#[from] anyhow::Error),
}
