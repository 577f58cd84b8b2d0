use amoskys_core::RetryPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
  /// Identity this agent publishes as; must exist in the bus trust map.
  pub agent_id: String,
  /// Bus endpoint, e.g. "https://bus.internal:50051".
  pub bus_address: String,
  /// Hex-encoded Ed25519 signing key file.
  pub signing_key_path: PathBuf,
  pub wal: WalConfig,
  #[serde(default)]
  pub tls: ClientTlsConfig,
  #[serde(default)]
  pub retry: RetryPolicy,
  #[serde(default)]
  pub publisher: PublisherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
  pub wal_path: PathBuf,
  #[serde(default = "default_high_water_records")]
  pub high_water_records: u64,
  #[serde(default = "default_high_water_bytes")]
  pub high_water_bytes: u64,
  #[serde(default)]
  pub backpressure_policy: BackpressurePolicy,
  #[serde(default = "default_purge_batch_size")]
  pub purge_batch_size: u64,
}

/// What `enqueue` does when the WAL hits high water. Dropping is a policy
/// choice, never silent: every drop increments `wal_dropped_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
  #[default]
  Block,
  Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientTlsConfig {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub ca: PathBuf,
  #[serde(default)]
  pub cert: PathBuf,
  #[serde(default)]
  pub key: PathBuf,
  /// Override for certificate hostname verification.
  #[serde(default)]
  pub domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
  /// Sleep between drain polls when the queue is empty.
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
  /// Ceiling for the multiplicative holdoff applied on repeated OVERLOAD.
  #[serde(default = "default_overload_holdoff_cap_ms")]
  pub overload_holdoff_cap_ms: u64,
}

fn default_high_water_records() -> u64 {
  10_000
}
fn default_high_water_bytes() -> u64 {
  64 * 1024 * 1024
}
fn default_purge_batch_size() -> u64 {
  256
}
fn default_poll_interval_ms() -> u64 {
  200
}
fn default_overload_holdoff_cap_ms() -> u64 {
  30_000
}

impl Default for PublisherConfig {
  fn default() -> Self {
    Self {
      poll_interval_ms: default_poll_interval_ms(),
      overload_holdoff_cap_ms: default_overload_holdoff_cap_ms(),
    }
  }
}

impl AgentConfig {
  pub fn load() -> Result<Self> {
    if let Ok(path) = env::var("AMOSKYS_AGENT_CONFIG") {
      return Self::from_file(&path)
        .with_context(|| format!("loading config from AMOSKYS_AGENT_CONFIG={}", path));
    }

    for candidate in ["/etc/amoskys/agent.yml", "agent.yml"] {
      if std::path::Path::new(candidate).exists() {
        return Self::from_file(candidate)
          .with_context(|| format!("loading config from {}", candidate));
      }
    }

    bail!("no configuration found; set AMOSKYS_AGENT_CONFIG or provide agent.yml")
  }

  pub fn from_file(path: &str) -> Result<Self> {
    let text = std::fs::read_to_string(path)?;
    let config: Self = serde_yaml::from_str(&text)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.agent_id.is_empty() {
      bail!("agent_id must not be empty");
    }

    if self.wal.high_water_records == 0 || self.wal.high_water_bytes == 0 {
      bail!("wal high water marks must be positive");
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn minimal_config_parses_with_defaults() {
    let yaml = r#"
agent_id: host-a
bus_address: "http://127.0.0.1:50051"
signing_key_path: "/etc/amoskys/agent.key"
wal:
  wal_path: "/var/lib/amoskys/wal.db"
"#;
    let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
    config.validate().unwrap();

    assert_eq!(config.wal.backpressure_policy, BackpressurePolicy::Block);
    assert_eq!(config.wal.high_water_records, 10_000);
    assert_eq!(config.retry.base_ms, 500);
    assert_eq!(config.publisher.overload_holdoff_cap_ms, 30_000);
  }

  #[test]
  fn drop_policy_parses() {
    let yaml = r#"
agent_id: host-a
bus_address: "http://127.0.0.1:50051"
signing_key_path: "agent.key"
wal:
  wal_path: "wal.db"
  backpressure_policy: drop
"#;
    let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.wal.backpressure_policy, BackpressurePolicy::Drop);
  }
}
