use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
  #[error("database error: {0}")]
  Sqlx(#[from] sqlx::Error),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("tls error: {0}")]
  Tls(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("trust map error: {0}")]
  Trust(#[from] amoskys_core::TrustError),

  #[error("general error: {0}")]
  Any(#[from] anyhow::Error),
}
