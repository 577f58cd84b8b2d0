//! The `Publish` pipeline: admission, schema, identity, signature, dedup,
//! durable store, ack.

use crate::AppState;
use amoskys_core::{schema_check, verify_envelope, PayloadKind};
use amoskys_protos::amoskys::v1::{
  event_bus_server::EventBus, publish_ack::Status as AckStatus, Envelope, PublishAck,
};
use metrics::{counter, gauge, histogram};
use prost::Message;
use sha2::{Digest, Sha256};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

/// Agent clocks are trusted within this tolerance; envelopes outside it are
/// still stored, but flagged.
const CLOCK_SKEW_TOLERANCE_NS: i64 = 5 * 60 * 1_000_000_000;

pub struct EventBusService {
  state: AppState,
}

impl EventBusService {
  pub fn new(state: AppState) -> Self {
    Self { state }
  }
}

#[tonic::async_trait]
impl EventBus for EventBusService {
  async fn publish(&self, request: Request<Envelope>) -> Result<Response<PublishAck>, Status> {
    let peer_fingerprint = peer_cert_fingerprint(&request);
    let envelope = request.into_inner();
    let ack = self.state.handle_publish(envelope, peer_fingerprint).await;
    Ok(Response::new(ack))
  }
}

/// SHA-256 fingerprint of the client certificate presented on this
/// connection, when the transport terminated mutual TLS.
fn peer_cert_fingerprint<T>(request: &Request<T>) -> Option<String> {
  let certs = request.peer_certs()?;
  let cert = certs.first()?;
  Some(hex::encode(Sha256::digest(cert.as_ref())))
}

/// Holds the admission permit for the duration of one publish and keeps the
/// inflight gauge in step with it.
struct AdmissionSlot {
  _permit: OwnedSemaphorePermit,
}

impl AdmissionSlot {
  fn new(permit: OwnedSemaphorePermit) -> Self {
    gauge!("inflight").increment(1.0);
    Self { _permit: permit }
  }
}

impl Drop for AdmissionSlot {
  fn drop(&mut self) {
    gauge!("inflight").decrement(1.0);
  }
}

impl AppState {
  /// Run one envelope through the full pipeline. Every exit path maps to one
  /// of the four ack statuses; transport failures never reach this function.
  #[instrument(skip(self, envelope, peer_fingerprint), fields(agent_id, event_id))]
  pub async fn handle_publish(
    &self,
    envelope: Envelope,
    peer_fingerprint: Option<String>,
  ) -> PublishAck {
    let agent_id = envelope.source_agent_id.clone();
    tracing::Span::current()
      .record("agent_id", agent_id.as_str())
      .record("event_id", envelope.event_id.as_str());

    // 1. Admission, before any per-envelope work.
    if self.overloaded.load(Ordering::Acquire) {
      counter!("overload_rejections_total").increment(1);
      return ack(AckStatus::Overload, &agent_id, "overload flag set");
    }

    let permit = match self.admission.clone().try_acquire_owned() {
      Ok(permit) => AdmissionSlot::new(permit),
      Err(_) => {
        counter!("overload_rejections_total").increment(1);
        return ack(AckStatus::Overload, &agent_id, "at capacity");
      }
    };

    // 2. Schema.
    let encoded_len = envelope.encoded_len();
    if encoded_len > self.config.limits.max_envelope_bytes {
      return ack(
        AckStatus::Invalid,
        &agent_id,
        format!(
          "envelope of {} bytes exceeds cap of {}",
          encoded_len, self.config.limits.max_envelope_bytes
        ),
      );
    }

    if let Err(e) = schema_check(&envelope) {
      return ack(AckStatus::Invalid, &agent_id, e.to_string());
    }

    // 3. Identity: the agent must be trusted, unexpired, and (when mTLS is
    // enforced) presenting the certificate the trust map binds to it.
    let trust = self.trust.snapshot();
    let trusted = match trust.get_valid(&agent_id, chrono::Utc::now()) {
      Ok(trusted) => trusted,
      Err(e) => return ack(AckStatus::Invalid, &agent_id, e.to_string()),
    };

    if self.config.tls.require_client_cert {
      let expected = trusted.cert_fingerprint.as_deref();
      let presented = peer_fingerprint.as_deref();
      let matches = match (expected, presented) {
        (Some(expected), Some(presented)) => expected == presented,
        _ => false,
      };
      if !matches {
        return ack(
          AckStatus::Invalid,
          &agent_id,
          "client certificate does not match trust map",
        );
      }
    }

    // 4. Signature over the canonical encoding.
    if verify_envelope(&envelope, &trusted.public_key).is_err() {
      counter!("signature_failures_total", "agent" => agent_id.clone()).increment(1);
      return ack(AckStatus::Invalid, &agent_id, "signature verification failed");
    }

    // 5. Dedup against already-persisted events.
    let event_id = envelope.event_id.clone();
    match self.store.contains(&event_id).await {
      Ok(true) => {
        counter!("dedup_hits_total").increment(1);
        return ack(AckStatus::Ok, &agent_id, "");
      }
      Ok(false) => {}
      Err(e) => {
        warn!("Dedup lookup failed: {}", e);
        return ack(AckStatus::Retry, &agent_id, "store unavailable");
      }
    }

    // 6. Claim the event id; a concurrent delivery of the same id is a
    // duplicate and the winner's store write covers both.
    if self.inflight.insert(event_id.clone(), ()).is_some() {
      counter!("dedup_hits_total").increment(1);
      return ack(AckStatus::Ok, &agent_id, "");
    }

    // 7. Durable append.
    let outcome = self.append(&envelope).await;
    self.inflight.remove(&event_id);
    drop(permit);

    match outcome {
      Ok(()) => ack(AckStatus::Ok, &agent_id, ""),
      Err(e) => {
        warn!("Event store append failed: {}", e);
        ack(AckStatus::Retry, &agent_id, "store write failed")
      }
    }
  }

  async fn append(&self, envelope: &Envelope) -> Result<(), crate::BusError> {
    let kind = envelope
      .payload
      .as_ref()
      .map(PayloadKind::of)
      .map(|k| k.as_str())
      .unwrap_or("unknown");

    let received_ns = now_ns();
    let skew = (envelope.timestamp_ns - received_ns).abs();
    let skew_flagged = skew > CLOCK_SKEW_TOLERANCE_NS;
    if skew_flagged {
      counter!("clock_skew_flagged_total").increment(1);
      debug!(
        skew_ns = skew,
        event_id = %envelope.event_id,
        "Envelope timestamp outside tolerance, storing flagged"
      );
    }

    let bytes = envelope.encode_to_vec();
    let start = Instant::now();
    let result = self
      .store
      .insert(
        &envelope.event_id,
        &envelope.source_agent_id,
        kind,
        envelope.timestamp_ns,
        received_ns,
        skew_flagged,
        &bytes,
      )
      .await;
    histogram!("store_latency_seconds").record(start.elapsed().as_secs_f64());

    match result {
      Ok(inserted) => {
        if !inserted {
          counter!("dedup_hits_total").increment(1);
        }
        self.store_failures.store(0, Ordering::Release);
        self.ready.store(true, Ordering::Release);
        Ok(())
      }
      Err(e) => {
        let failures = self.store_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= crate::STORE_FAILURE_THRESHOLD {
          self.ready.store(false, Ordering::Release);
        }
        Err(e)
      }
    }
  }
}

fn ack(status: AckStatus, agent_id: &str, detail: impl Into<String>) -> PublishAck {
  let label = match status {
    AckStatus::Ok => "ok",
    AckStatus::Retry => "retry",
    AckStatus::Invalid => "invalid",
    AckStatus::Overload => "overload",
    AckStatus::Unspecified => "unspecified",
  };
  counter!("received_total", "status" => label, "agent" => agent_id.to_string()).increment(1);

  PublishAck {
    status: status as i32,
    detail: detail.into(),
  }
}

fn now_ns() -> i64 {
  chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{AppState, BusConfig};
  use amoskys_core::AgentSigner;
  use amoskys_protos::amoskys::v1::envelope::Payload;
  use amoskys_protos::amoskys::v1::security_event::{AuthResult, AuthType};
  use amoskys_protos::amoskys::v1::SecurityEvent;
  use std::io::Write;

  struct Fixture {
    state: AppState,
    signer: AgentSigner,
    _dir: tempfile::TempDir,
    _trust_file: tempfile::NamedTempFile,
  }

  async fn fixture() -> Fixture {
    fixture_with(|_| {}).await
  }

  async fn fixture_with(tweak: impl FnOnce(&mut BusConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let signer = AgentSigner::generate();

    let mut trust_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(trust_file, "agents:").unwrap();
    writeln!(trust_file, "  - agent_id: agent-1").unwrap();
    writeln!(trust_file, "    public_key: {}", signer.public_key_hex()).unwrap();
    writeln!(trust_file, "    valid_until: 2099-01-01T00:00:00Z").unwrap();

    let yaml = format!(
      r#"
server:
  listen_address: "127.0.0.1:50051"
  store_path: "{}"
tls:
  enabled: false
  require_client_cert: false
trust:
  trust_map_path: "{}"
"#,
      dir.path().join("events.db").display(),
      trust_file.path().display(),
    );
    let mut config: BusConfig = serde_yaml::from_str(&yaml).unwrap();
    tweak(&mut config);

    let state = AppState::try_new(config).await.unwrap();
    Fixture {
      state,
      signer,
      _dir: dir,
      _trust_file: trust_file,
    }
  }

  fn signed_envelope(signer: &AgentSigner, event_id: &str) -> Envelope {
    let mut envelope = Envelope {
      version: 1,
      source_agent_id: "agent-1".to_string(),
      event_id: event_id.to_string(),
      timestamp_ns: now_ns(),
      payload: Some(Payload::SecurityEvent(SecurityEvent {
        auth_type: AuthType::Ssh as i32,
        result: AuthResult::Failure as i32,
        user: "admin".to_string(),
        source_ip: "203.0.113.42".to_string(),
        sudo_command: String::new(),
      })),
      attributes: Default::default(),
      signature: Vec::new(),
    };
    signer.sign_envelope(&mut envelope).unwrap();
    envelope
  }

  #[tokio::test]
  async fn valid_envelope_is_stored_and_acked_ok() {
    let f = fixture().await;
    let envelope = signed_envelope(&f.signer, "evt-1");

    let ack = f.state.handle_publish(envelope, None).await;
    assert_eq!(ack.status, AckStatus::Ok as i32);
    assert!(f.state.store.contains("evt-1").await.unwrap());
  }

  #[tokio::test]
  async fn replayed_event_id_acks_ok_without_second_row() {
    let f = fixture().await;
    let envelope = signed_envelope(&f.signer, "evt-1");

    let first = f.state.handle_publish(envelope.clone(), None).await;
    let second = f.state.handle_publish(envelope, None).await;

    assert_eq!(first.status, AckStatus::Ok as i32);
    assert_eq!(second.status, AckStatus::Ok as i32);
    assert_eq!(f.state.store.count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn tampered_signature_is_invalid_and_never_stored() {
    let f = fixture().await;
    let mut envelope = signed_envelope(&f.signer, "evt-1");
    envelope.signature[0] ^= 0xFF;

    let ack = f.state.handle_publish(envelope, None).await;
    assert_eq!(ack.status, AckStatus::Invalid as i32);
    assert_eq!(f.state.store.count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn unknown_agent_is_invalid() {
    let f = fixture().await;
    let rogue = AgentSigner::generate();
    let mut envelope = signed_envelope(&rogue, "evt-1");
    envelope.source_agent_id = "agent-unknown".to_string();
    rogue.sign_envelope(&mut envelope).unwrap();

    let ack = f.state.handle_publish(envelope, None).await;
    assert_eq!(ack.status, AckStatus::Invalid as i32);
  }

  #[tokio::test]
  async fn wrong_key_for_known_agent_is_invalid() {
    let f = fixture().await;
    let rogue = AgentSigner::generate();
    let envelope = signed_envelope(&rogue, "evt-1");

    let ack = f.state.handle_publish(envelope, None).await;
    assert_eq!(ack.status, AckStatus::Invalid as i32);
    assert_eq!(f.state.store.count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn malformed_envelope_is_invalid() {
    let f = fixture().await;
    let mut envelope = signed_envelope(&f.signer, "evt-1");
    envelope.payload = None;
    f.signer.sign_envelope(&mut envelope).unwrap();

    let ack = f.state.handle_publish(envelope, None).await;
    assert_eq!(ack.status, AckStatus::Invalid as i32);
  }

  #[tokio::test]
  async fn oversized_envelope_is_invalid() {
    let f = fixture_with(|config| config.limits.max_envelope_bytes = 16).await;
    let envelope = signed_envelope(&f.signer, "evt-1");

    let ack = f.state.handle_publish(envelope, None).await;
    assert_eq!(ack.status, AckStatus::Invalid as i32);
  }

  #[tokio::test]
  async fn overload_flag_rejects_before_validation() {
    let f = fixture_with(|config| config.limits.overload_flag = true).await;
    let envelope = signed_envelope(&f.signer, "evt-1");

    let ack = f.state.handle_publish(envelope, None).await;
    assert_eq!(ack.status, AckStatus::Overload as i32);
    assert_eq!(f.state.store.count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn exhausted_admission_returns_overload() {
    let f = fixture_with(|config| config.limits.max_inflight = 1).await;

    // Hold the only admission slot, as a stalled publish would.
    let held = f.state.admission.clone().try_acquire_owned().unwrap();

    let envelope = signed_envelope(&f.signer, "evt-1");
    let ack = f.state.handle_publish(envelope.clone(), None).await;
    assert_eq!(ack.status, AckStatus::Overload as i32);

    drop(held);
    let ack = f.state.handle_publish(envelope, None).await;
    assert_eq!(ack.status, AckStatus::Ok as i32);
  }

  #[tokio::test]
  async fn concurrent_duplicates_persist_exactly_once() {
    let f = fixture().await;
    let envelope = signed_envelope(&f.signer, "evt-dup");

    let mut handles = Vec::new();
    for _ in 0..10 {
      let state = f.state.clone();
      let envelope = envelope.clone();
      handles.push(tokio::spawn(async move {
        state.handle_publish(envelope, None).await
      }));
    }

    for handle in handles {
      let ack = handle.await.unwrap();
      // A duplicate may lose the admission race under max_inflight pressure,
      // but it must never produce INVALID or a second row.
      assert_ne!(ack.status, AckStatus::Invalid as i32);
    }
    assert_eq!(f.state.store.count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn fingerprint_mismatch_is_invalid_when_required() {
    let f = fixture_with(|config| config.tls.require_client_cert = true).await;
    let envelope = signed_envelope(&f.signer, "evt-1");

    // Trust map entry has no fingerprint and no client cert was presented.
    let ack = f.state.handle_publish(envelope, None).await;
    assert_eq!(ack.status, AckStatus::Invalid as i32);
  }

  #[tokio::test]
  async fn far_future_timestamp_is_stored_flagged() {
    let f = fixture().await;
    let mut envelope = signed_envelope(&f.signer, "evt-skew");
    envelope.timestamp_ns = now_ns() + 3_600 * 1_000_000_000;
    f.signer.sign_envelope(&mut envelope).unwrap();

    let ack = f.state.handle_publish(envelope, None).await;
    assert_eq!(ack.status, AckStatus::Ok as i32);

    let stored = f.state.store.events_after(0, 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].skew_flagged);
  }
}
