//! Embeddable publishing runtime for AMOSKYS agents.
//!
//! A collector hands fully formed envelopes to [`Agent::enqueue`]; the SDK
//! signs them, lands them in the write-ahead log, and a background publisher
//! delivers each one to the bus at least once. The bus dedups by event id,
//! which from this side of the wire reads as exactly-once.

pub mod client;
mod config;
mod error;
pub mod observability;
pub mod publisher;
pub mod wal;

pub use config::*;
pub use error::AgentError;
pub use publisher::{DrainOutcome, Publisher};
pub use wal::{Wal, WalRecord};

use amoskys_core::{AgentSigner, SUPPORTED_VERSION};
use amoskys_protos::amoskys::v1::Envelope;
use client::{GrpcTransport, PublishTransport};
use prost::Message;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

pub struct Agent {
  config: AgentConfig,
  signer: AgentSigner,
  wal: Arc<Wal>,
}

impl Agent {
  pub async fn open(config: AgentConfig) -> Result<Self, AgentError> {
    let signer = AgentSigner::from_key_file(&config.signing_key_path)?;
    let wal = Arc::new(Wal::open(config.wal.clone()).await?);

    info!(agent_id = %config.agent_id, "Agent runtime opened");
    Ok(Self {
      config,
      signer,
      wal,
    })
  }

  /// Stamp, sign, and durably append one envelope. Returns once the record
  /// is on disk; never blocks on the network.
  pub async fn enqueue(&self, mut envelope: Envelope) -> Result<i64, AgentError> {
    envelope.source_agent_id = self.config.agent_id.clone();
    if envelope.version == 0 {
      envelope.version = SUPPORTED_VERSION;
    }
    if envelope.event_id.is_empty() {
      envelope.event_id = uuid::Uuid::now_v7().to_string();
    }

    self.signer.sign_envelope(&mut envelope)?;

    let bytes = envelope.encode_to_vec();
    self.wal.enqueue(&envelope.event_id, &bytes).await
  }

  /// Start the background publisher over the configured gRPC transport.
  pub fn start_publisher(
    &self,
    shutdown: broadcast::Receiver<()>,
  ) -> Result<tokio::task::JoinHandle<()>, AgentError> {
    let transport: Arc<dyn PublishTransport> = Arc::new(GrpcTransport::connect(&self.config)?);
    Ok(self.start_publisher_with(transport, shutdown))
  }

  /// Start the publisher over a caller-supplied transport.
  pub fn start_publisher_with(
    &self,
    transport: Arc<dyn PublishTransport>,
    shutdown: broadcast::Receiver<()>,
  ) -> tokio::task::JoinHandle<()> {
    let publisher = Publisher::new(
      Arc::clone(&self.wal),
      transport,
      self.config.retry.clone(),
      self.config.publisher.clone(),
    );
    tokio::spawn(async move { publisher.run(shutdown).await })
  }

  pub fn wal(&self) -> &Arc<Wal> {
    &self.wal
  }

  pub fn agent_id(&self) -> &str {
    &self.config.agent_id
  }

  /// Park in-flight work and close the WAL cleanly.
  pub async fn close(&self) -> Result<(), AgentError> {
    self.wal.close().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use amoskys_core::verify_envelope;
  use amoskys_protos::amoskys::v1::{envelope::Payload, MetricEvent};
  use std::io::Write;

  const TEST_KEY: [u8; 32] = [7u8; 32];

  async fn agent_in(dir: &tempfile::TempDir) -> Agent {
    let key_path = dir.path().join("agent.key");
    let mut file = std::fs::File::create(&key_path).unwrap();
    write!(file, "{}", hex::encode(TEST_KEY)).unwrap();

    let config = AgentConfig {
      agent_id: "host-a".to_string(),
      bus_address: "http://127.0.0.1:50051".to_string(),
      signing_key_path: key_path,
      wal: WalConfig {
        wal_path: dir.path().join("wal.db"),
        high_water_records: 100,
        high_water_bytes: 1024 * 1024,
        backpressure_policy: BackpressurePolicy::Block,
        purge_batch_size: 256,
      },
      tls: Default::default(),
      retry: Default::default(),
      publisher: Default::default(),
    };

    Agent::open(config).await.unwrap()
  }

  fn metric_envelope() -> Envelope {
    Envelope {
      version: 0,
      source_agent_id: String::new(),
      event_id: String::new(),
      timestamp_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(1),
      payload: Some(Payload::MetricEvent(MetricEvent {
        name: "cpu".to_string(),
        value: 0.5,
        unit: "ratio".to_string(),
      })),
      attributes: Default::default(),
      signature: Vec::new(),
    }
  }

  #[tokio::test]
  async fn enqueue_stamps_signs_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let agent = agent_in(&dir).await;

    agent.enqueue(metric_envelope()).await.unwrap();

    let record = agent.wal().next_ready().await.unwrap().unwrap();
    let stored = Envelope::decode(record.envelope.as_slice()).unwrap();

    assert_eq!(stored.source_agent_id, "host-a");
    assert_eq!(stored.version, SUPPORTED_VERSION);
    assert!(!stored.event_id.is_empty());

    let expected_key = AgentSigner::from_bytes(&TEST_KEY).verifying_key();
    assert!(verify_envelope(&stored, &expected_key).is_ok());
  }

  #[tokio::test]
  async fn wal_survives_reopen_with_events_intact() {
    let dir = tempfile::tempdir().unwrap();
    let event_id;
    {
      let agent = agent_in(&dir).await;
      let mut envelope = metric_envelope();
      envelope.event_id = "evt-persist".to_string();
      agent.enqueue(envelope).await.unwrap();
      event_id = "evt-persist";
      agent.close().await.unwrap();
    }

    let agent = agent_in(&dir).await;
    let record = agent.wal().next_ready().await.unwrap().unwrap();
    assert_eq!(record.event_id, event_id);
  }
}
