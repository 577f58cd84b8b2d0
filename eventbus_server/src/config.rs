use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf};

#[derive(Debug, Serialize, Deserialize)]
pub struct BusConfig {
  pub server: ServerConfig,
  #[serde(default)]
  pub tls: TlsConfig,
  pub trust: TrustConfig,
  #[serde(default)]
  pub limits: LimitsConfig,
  #[serde(default)]
  pub observability: ObservabilityConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerConfig {
  /// gRPC listen address, e.g. "0.0.0.0:50051".
  pub listen_address: String,
  /// Path of the sqlite event store.
  pub store_path: PathBuf,
  #[serde(default = "default_retention_hours")]
  pub retention_hours: u64,
  #[serde(default = "default_retention_sweep_seconds")]
  pub retention_sweep_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TlsConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default)]
  pub ca: PathBuf,
  #[serde(default)]
  pub cert: PathBuf,
  #[serde(default)]
  pub key: PathBuf,
  /// Require the client certificate fingerprint to match the trust map.
  #[serde(default = "default_true")]
  pub require_client_cert: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrustConfig {
  pub trust_map_path: PathBuf,
  #[serde(default = "default_trust_reload_seconds")]
  pub reload_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
  #[serde(default = "default_max_inflight")]
  pub max_inflight: usize,
  #[serde(default = "default_max_envelope_bytes")]
  pub max_envelope_bytes: usize,
  /// Operator switch: reject every publish with OVERLOAD while set.
  #[serde(default)]
  pub overload_flag: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ObservabilityConfig {
  #[serde(default = "default_metrics_address")]
  pub metrics_address: String,
  #[serde(default = "default_health_address")]
  pub health_address: String,
}

fn default_true() -> bool {
  true
}
fn default_retention_hours() -> u64 {
  168
}
fn default_retention_sweep_seconds() -> u64 {
  300
}
fn default_trust_reload_seconds() -> u64 {
  60
}
fn default_max_inflight() -> usize {
  100
}
fn default_max_envelope_bytes() -> usize {
  64 * 1024
}
fn default_metrics_address() -> String {
  "0.0.0.0:9100".to_string()
}
fn default_health_address() -> String {
  "0.0.0.0:9101".to_string()
}

impl Default for TlsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      ca: PathBuf::new(),
      cert: PathBuf::new(),
      key: PathBuf::new(),
      require_client_cert: true,
    }
  }
}

impl Default for LimitsConfig {
  fn default() -> Self {
    Self {
      max_inflight: default_max_inflight(),
      max_envelope_bytes: default_max_envelope_bytes(),
      overload_flag: false,
    }
  }
}

impl Default for ObservabilityConfig {
  fn default() -> Self {
    Self {
      metrics_address: default_metrics_address(),
      health_address: default_health_address(),
    }
  }
}

impl BusConfig {
  /// Resolve the config file: env var override first, then fixed locations.
  pub fn load() -> Result<Self> {
    if let Ok(path) = env::var("AMOSKYS_BUS_CONFIG") {
      return Self::from_file(&path)
        .with_context(|| format!("loading config from AMOSKYS_BUS_CONFIG={}", path));
    }

    for candidate in ["/etc/amoskys/eventbus.yml", "eventbus.yml"] {
      if std::path::Path::new(candidate).exists() {
        return Self::from_file(candidate)
          .with_context(|| format!("loading config from {}", candidate));
      }
    }

    bail!("no configuration found; set AMOSKYS_BUS_CONFIG or provide eventbus.yml")
  }

  pub fn from_file(path: &str) -> Result<Self> {
    let text = std::fs::read_to_string(path)?;
    let config: Self = serde_yaml::from_str(&text)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.server.listen_address.parse::<std::net::SocketAddr>().is_err() {
      bail!("invalid listen_address: {}", self.server.listen_address);
    }

    if self.limits.max_inflight == 0 {
      bail!("max_inflight must be at least 1");
    }

    if self.tls.enabled {
      for (name, path) in [
        ("tls.ca", &self.tls.ca),
        ("tls.cert", &self.tls.cert),
        ("tls.key", &self.tls.key),
      ] {
        if !path.exists() {
          bail!("{} does not exist: {}", name, path.display());
        }
      }
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
server:
  listen_address: "127.0.0.1:50051"
  store_path: "/var/lib/amoskys/events.db"
tls:
  enabled: false
trust:
  trust_map_path: "/etc/amoskys/trust.yml"
"#;
    let config: BusConfig = serde_yaml::from_str(yaml).unwrap();
    config.validate().unwrap();

    assert_eq!(config.limits.max_inflight, 100);
    assert_eq!(config.server.retention_hours, 168);
    assert!(!config.limits.overload_flag);
    assert!(config.tls.require_client_cert);
  }

  #[test]
  fn zero_inflight_is_rejected() {
    let yaml = r#"
server:
  listen_address: "127.0.0.1:50051"
  store_path: "events.db"
tls:
  enabled: false
trust:
  trust_map_path: "trust.yml"
limits:
  max_inflight: 0
"#;
    let config: BusConfig = serde_yaml::from_str(yaml).unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn bad_listen_address_is_rejected() {
    let yaml = r#"
server:
  listen_address: "not-an-address"
  store_path: "events.db"
tls:
  enabled: false
trust:
  trust_map_path: "trust.yml"
"#;
    let config: BusConfig = serde_yaml::from_str(yaml).unwrap();
    assert!(config.validate().is_err());
  }
}
