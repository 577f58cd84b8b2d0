//! Server-side mutual TLS material.

use crate::{BusError, TlsConfig};
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

/// Build the tonic TLS config: present our identity, require client
/// certificates chaining to the configured CA.
pub fn server_tls_config(config: &TlsConfig) -> Result<ServerTlsConfig, BusError> {
  let cert = std::fs::read_to_string(&config.cert)
    .map_err(|e| BusError::Tls(format!("reading {}: {}", config.cert.display(), e)))?;
  let key = std::fs::read_to_string(&config.key)
    .map_err(|e| BusError::Tls(format!("reading {}: {}", config.key.display(), e)))?;
  let ca = std::fs::read_to_string(&config.ca)
    .map_err(|e| BusError::Tls(format!("reading {}: {}", config.ca.display(), e)))?;

  Ok(
    ServerTlsConfig::new()
      .identity(Identity::from_pem(cert, key))
      .client_ca_root(Certificate::from_pem(ca)),
  )
}
