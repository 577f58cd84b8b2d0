//! Trust map: the authoritative binding from agent id to signing key and
//! client certificate fingerprint.
//!
//! The map is loaded at startup and republished atomically on reload; request
//! paths take a cheap `Arc` snapshot and never block a reload in progress.

use crate::crypto::parse_public_key;
use crate::error::TrustError;
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct TrustMapFile {
  agents: Vec<TrustEntryFile>,
}

#[derive(Debug, Deserialize)]
struct TrustEntryFile {
  agent_id: String,
  public_key: String,
  #[serde(default)]
  cert_fingerprint: Option<String>,
  valid_until: DateTime<Utc>,
}

/// One trusted agent.
#[derive(Debug, Clone)]
pub struct TrustedAgent {
  pub agent_id: String,
  pub public_key: VerifyingKey,
  /// Lowercase hex SHA-256 of the agent's client certificate (DER).
  pub cert_fingerprint: Option<String>,
  pub valid_until: DateTime<Utc>,
}

/// Immutable snapshot of the trust configuration.
#[derive(Debug, Default, Clone)]
pub struct TrustMap {
  agents: HashMap<String, TrustedAgent>,
}

impl TrustMap {
  pub fn load(path: &Path) -> Result<Self, TrustError> {
    let text = std::fs::read_to_string(path)?;
    let file: TrustMapFile = serde_yaml::from_str(&text)?;

    let mut agents = HashMap::with_capacity(file.agents.len());
    for entry in file.agents {
      let public_key = parse_public_key(&entry.public_key).map_err(|e| {
        TrustError::InvalidEntry {
          agent_id: entry.agent_id.clone(),
          reason: e.to_string(),
        }
      })?;

      let cert_fingerprint = entry.cert_fingerprint.map(|fp| fp.to_lowercase());

      agents.insert(
        entry.agent_id.clone(),
        TrustedAgent {
          agent_id: entry.agent_id,
          public_key,
          cert_fingerprint,
          valid_until: entry.valid_until,
        },
      );
    }

    Ok(Self { agents })
  }

  pub fn len(&self) -> usize {
    self.agents.len()
  }

  pub fn is_empty(&self) -> bool {
    self.agents.is_empty()
  }

  pub fn get(&self, agent_id: &str) -> Option<&TrustedAgent> {
    self.agents.get(agent_id)
  }

  /// Look up an agent and enforce its expiry against `now`.
  pub fn get_valid(&self, agent_id: &str, now: DateTime<Utc>) -> Result<&TrustedAgent, TrustError> {
    let agent = self
      .agents
      .get(agent_id)
      .ok_or_else(|| TrustError::UnknownAgent(agent_id.to_string()))?;

    if agent.valid_until <= now {
      return Err(TrustError::Expired(agent_id.to_string()));
    }

    Ok(agent)
  }
}

/// Shared handle publishing trust snapshots to request paths.
#[derive(Debug)]
pub struct TrustMapHandle {
  path: PathBuf,
  current: RwLock<Arc<TrustMap>>,
}

impl TrustMapHandle {
  /// Load the trust map from disk; startup fails if the file is unreadable
  /// or any entry is malformed.
  pub fn load(path: impl Into<PathBuf>) -> Result<Self, TrustError> {
    let path = path.into();
    let map = TrustMap::load(&path)?;
    info!(agents = map.len(), path = %path.display(), "Trust map loaded");

    Ok(Self {
      path,
      current: RwLock::new(Arc::new(map)),
    })
  }

  /// Cheap copy of the current snapshot.
  pub fn snapshot(&self) -> Arc<TrustMap> {
    self
      .current
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }

  /// Re-read the file and publish a new snapshot. A failed parse keeps the
  /// previous snapshot in place.
  pub fn reload(&self) -> Result<usize, TrustError> {
    let map = TrustMap::load(&self.path)?;
    let count = map.len();
    let mut guard = self
      .current
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Arc::new(map);
    Ok(count)
  }

  /// Periodically reload the trust map until the task is dropped.
  pub fn start_reload_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
    let handle = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await; // the startup load already happened
      loop {
        ticker.tick().await;
        match handle.reload() {
          Ok(count) => info!(agents = count, "Trust map reloaded"),
          Err(e) => {
            metrics::counter!("trust_map_reload_errors_total").increment(1);
            warn!("Trust map reload failed, keeping previous snapshot: {}", e);
          }
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crypto::AgentSigner;
  use std::io::Write;

  fn write_trust_file(entries: &[(String, String, &str)]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "agents:").unwrap();
    for (agent_id, key_hex, valid_until) in entries {
      writeln!(file, "  - agent_id: {}", agent_id).unwrap();
      writeln!(file, "    public_key: {}", key_hex).unwrap();
      writeln!(file, "    valid_until: {}", valid_until).unwrap();
    }
    file
  }

  #[test]
  fn loads_and_looks_up_agents() {
    let signer = AgentSigner::generate();
    let file = write_trust_file(&[(
      "agent-1".to_string(),
      signer.public_key_hex(),
      "2099-01-01T00:00:00Z",
    )]);

    let map = TrustMap::load(file.path()).unwrap();
    assert_eq!(map.len(), 1);

    let agent = map.get_valid("agent-1", Utc::now()).unwrap();
    assert_eq!(agent.public_key, signer.verifying_key());
  }

  #[test]
  fn rejects_unknown_and_expired_agents() {
    let signer = AgentSigner::generate();
    let file = write_trust_file(&[(
      "agent-old".to_string(),
      signer.public_key_hex(),
      "2020-01-01T00:00:00Z",
    )]);

    let map = TrustMap::load(file.path()).unwrap();

    assert!(matches!(
      map.get_valid("agent-x", Utc::now()),
      Err(TrustError::UnknownAgent(_))
    ));
    assert!(matches!(
      map.get_valid("agent-old", Utc::now()),
      Err(TrustError::Expired(_))
    ));
  }

  #[test]
  fn bad_key_material_fails_load() {
    let file = write_trust_file(&[(
      "agent-1".to_string(),
      "not-hex".to_string(),
      "2099-01-01T00:00:00Z",
    )]);

    assert!(matches!(
      TrustMap::load(file.path()),
      Err(TrustError::InvalidEntry { .. })
    ));
  }

  #[test]
  fn reload_keeps_old_snapshot_on_parse_failure() {
    let signer = AgentSigner::generate();
    let file = write_trust_file(&[(
      "agent-1".to_string(),
      signer.public_key_hex(),
      "2099-01-01T00:00:00Z",
    )]);

    let handle = TrustMapHandle::load(file.path()).unwrap();
    assert_eq!(handle.snapshot().len(), 1);

    std::fs::write(file.path(), "agents: [not valid").unwrap();
    assert!(handle.reload().is_err());
    assert_eq!(handle.snapshot().len(), 1);
  }
}
