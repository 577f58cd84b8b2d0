//! Transport seam between the publisher and the bus.
//!
//! The publisher talks to `PublishTransport` so retry behavior can be tested
//! against scripted acks without a live gRPC endpoint.

use crate::config::AgentConfig;
use crate::error::AgentError;
use amoskys_protos::amoskys::v1::{EventBusClient, Envelope, PublishAck};
use async_trait::async_trait;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing::info;

#[async_trait]
pub trait PublishTransport: Send + Sync {
  async fn publish(&self, envelope: Envelope) -> Result<PublishAck, AgentError>;
}

/// gRPC transport with mutual TLS to the bus.
pub struct GrpcTransport {
  client: EventBusClient<Channel>,
}

impl GrpcTransport {
  /// Build the channel lazily so the agent starts (and accumulates WAL)
  /// even while the bus is unreachable.
  pub fn connect(config: &AgentConfig) -> Result<Self, AgentError> {
    let mut endpoint = Channel::from_shared(config.bus_address.clone())
      .map_err(|e| AgentError::Config(format!("invalid bus_address: {}", e)))?;

    if config.tls.enabled {
      let ca = std::fs::read_to_string(&config.tls.ca)?;
      let cert = std::fs::read_to_string(&config.tls.cert)?;
      let key = std::fs::read_to_string(&config.tls.key)?;

      let mut tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key));
      if let Some(domain) = &config.tls.domain {
        tls = tls.domain_name(domain.clone());
      }

      endpoint = endpoint
        .tls_config(tls)
        .map_err(|e| AgentError::Transport(e.to_string()))?;
    }

    let channel = endpoint.connect_lazy();
    info!(bus = %config.bus_address, tls = config.tls.enabled, "Bus transport configured");

    Ok(Self {
      client: EventBusClient::new(channel),
    })
  }
}

#[async_trait]
impl PublishTransport for GrpcTransport {
  async fn publish(&self, envelope: Envelope) -> Result<PublishAck, AgentError> {
    let mut client = self.client.clone();
    let response = client
      .publish(tonic::Request::new(envelope))
      .await
      .map_err(|status| AgentError::Transport(status.to_string()))?;
    Ok(response.into_inner())
  }
}
