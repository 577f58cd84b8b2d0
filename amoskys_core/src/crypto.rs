//! Envelope signing primitives.

use crate::canonical::canonical_bytes;
use crate::error::CryptoError;
use amoskys_protos::amoskys::v1::Envelope;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Holds an agent's Ed25519 signing key and stamps envelopes with detached
/// signatures over their canonical encoding.
#[derive(Clone)]
pub struct AgentSigner {
  signing_key: SigningKey,
}

impl AgentSigner {
  /// Generate a fresh random key pair.
  pub fn generate() -> Self {
    let mut csprng = OsRng;
    Self {
      signing_key: SigningKey::generate(&mut csprng),
    }
  }

  /// Create from raw signing key bytes.
  pub fn from_bytes(bytes: &[u8; 32]) -> Self {
    Self {
      signing_key: SigningKey::from_bytes(bytes),
    }
  }

  /// Load a hex-encoded 32-byte signing key from disk.
  pub fn from_key_file(path: &std::path::Path) -> Result<Self, CryptoError> {
    let text = std::fs::read_to_string(path)
      .map_err(|e| CryptoError::InvalidKeyFormat(format!("{}: {}", path.display(), e)))?;
    let bytes = hex::decode(text.trim())
      .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;

    let key: [u8; 32] = bytes
      .try_into()
      .map_err(|_| CryptoError::InvalidKeyFormat("signing key must be 32 bytes".to_string()))?;

    Ok(Self::from_bytes(&key))
  }

  pub fn verifying_key(&self) -> VerifyingKey {
    self.signing_key.verifying_key()
  }

  /// Hex encoding of the public half, as stored in the trust map.
  pub fn public_key_hex(&self) -> String {
    hex::encode(self.signing_key.verifying_key().as_bytes())
  }

  /// Sign the canonical encoding of the envelope and store the detached
  /// signature in its `signature` field.
  pub fn sign_envelope(&self, envelope: &mut Envelope) -> Result<(), CryptoError> {
    envelope.signature.clear();
    let bytes = canonical_bytes(envelope);
    let signature = self
      .signing_key
      .try_sign(&bytes)
      .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
    envelope.signature = signature.to_bytes().to_vec();
    Ok(())
  }
}

/// Parse a hex-encoded Ed25519 public key.
pub fn parse_public_key(key_hex: &str) -> Result<VerifyingKey, CryptoError> {
  let bytes = hex::decode(key_hex).map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;

  let key: [u8; 32] = bytes
    .try_into()
    .map_err(|_| CryptoError::InvalidKeyFormat("public key must be 32 bytes".to_string()))?;

  VerifyingKey::from_bytes(&key).map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))
}

/// Verify an envelope's detached signature against a trusted public key.
pub fn verify_envelope(envelope: &Envelope, key: &VerifyingKey) -> Result<(), CryptoError> {
  let signature =
    Signature::from_slice(&envelope.signature).map_err(|_| CryptoError::VerificationFailed)?;

  // Re-derive the signed bytes with the signature field zeroed.
  let mut unsigned = envelope.clone();
  unsigned.signature.clear();
  let bytes = canonical_bytes(&unsigned);

  key
    .verify(&bytes, &signature)
    .map_err(|_| CryptoError::VerificationFailed)
}

#[cfg(test)]
mod tests {
  use super::*;
  use amoskys_protos::amoskys::v1::{envelope::Payload, MetricEvent};

  fn envelope() -> Envelope {
    Envelope {
      version: 1,
      source_agent_id: "agent-1".to_string(),
      event_id: "evt-1".to_string(),
      timestamp_ns: 1_700_000_000_000_000_000,
      payload: Some(Payload::MetricEvent(MetricEvent {
        name: "load".to_string(),
        value: 1.25,
        unit: "ratio".to_string(),
      })),
      attributes: Default::default(),
      signature: Vec::new(),
    }
  }

  #[test]
  fn sign_then_verify_roundtrip() {
    let signer = AgentSigner::generate();
    let mut e = envelope();
    signer.sign_envelope(&mut e).unwrap();

    assert_eq!(e.signature.len(), 64);
    assert!(verify_envelope(&e, &signer.verifying_key()).is_ok());
  }

  #[test]
  fn tampered_envelope_fails_verification() {
    let signer = AgentSigner::generate();
    let mut e = envelope();
    signer.sign_envelope(&mut e).unwrap();

    e.timestamp_ns += 1;
    assert!(verify_envelope(&e, &signer.verifying_key()).is_err());
  }

  #[test]
  fn altered_signature_fails_verification() {
    let signer = AgentSigner::generate();
    let mut e = envelope();
    signer.sign_envelope(&mut e).unwrap();

    e.signature[0] ^= 0xFF;
    assert!(verify_envelope(&e, &signer.verifying_key()).is_err());
  }

  #[test]
  fn wrong_key_fails_verification() {
    let signer = AgentSigner::generate();
    let other = AgentSigner::generate();
    let mut e = envelope();
    signer.sign_envelope(&mut e).unwrap();

    assert!(verify_envelope(&e, &other.verifying_key()).is_err());
  }

  #[test]
  fn public_key_hex_parses_back() {
    let signer = AgentSigner::generate();
    let parsed = parse_public_key(&signer.public_key_hex()).unwrap();
    assert_eq!(parsed, signer.verifying_key());
  }
}
