use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
  pub engine: EngineConfig,
  #[serde(default)]
  pub rules: RulesConfig,
  #[serde(default)]
  pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
  /// Incident and risk snapshot database.
  pub db_path: PathBuf,
  /// The bus event store this engine reads from.
  pub event_store_path: PathBuf,
  #[serde(default = "default_window_minutes")]
  pub window_minutes: u64,
  #[serde(default = "default_eval_interval_seconds")]
  pub eval_interval_seconds: u64,
  #[serde(default = "default_per_device_event_cap")]
  pub per_device_event_cap: usize,
  /// Mailbox capacity between the store poller and the driver.
  #[serde(default = "default_mailbox_capacity")]
  pub mailbox_capacity: usize,
  /// Events pulled from the store per poll.
  #[serde(default = "default_poll_batch")]
  pub poll_batch: i64,
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
  /// Executable path prefixes treated as suspicious launch locations.
  #[serde(default = "default_suspicious_prefixes")]
  pub suspicious_process_prefixes: Vec<String>,
  /// Path fragments treated as suspicious anywhere in an executable path.
  #[serde(default = "default_suspicious_markers")]
  pub suspicious_process_markers: Vec<String>,
  /// Destinations ("ip:port") excluded from the multi-tactic flow check.
  #[serde(default)]
  pub flow_whitelist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
  #[serde(default = "default_metrics_address")]
  pub metrics_address: String,
  #[serde(default = "default_health_address")]
  pub health_address: String,
}

fn default_window_minutes() -> u64 {
  30
}
fn default_eval_interval_seconds() -> u64 {
  60
}
fn default_per_device_event_cap() -> usize {
  5_000
}
fn default_mailbox_capacity() -> usize {
  1_024
}
fn default_poll_batch() -> i64 {
  500
}
fn default_poll_interval_ms() -> u64 {
  1_000
}
fn default_suspicious_prefixes() -> Vec<String> {
  vec![
    "/tmp/".to_string(),
    "/private/tmp/".to_string(),
    "/var/tmp/".to_string(),
  ]
}
fn default_suspicious_markers() -> Vec<String> {
  vec!["/Downloads/".to_string()]
}
fn default_metrics_address() -> String {
  "0.0.0.0:9102".to_string()
}
fn default_health_address() -> String {
  "0.0.0.0:9103".to_string()
}

impl Default for RulesConfig {
  fn default() -> Self {
    Self {
      suspicious_process_prefixes: default_suspicious_prefixes(),
      suspicious_process_markers: default_suspicious_markers(),
      flow_whitelist: Vec::new(),
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

impl FusionConfig {
  pub fn load() -> Result<Self> {
    if let Ok(path) = env::var("AMOSKYS_FUSION_CONFIG") {
      return Self::from_file(&path)
        .with_context(|| format!("loading config from AMOSKYS_FUSION_CONFIG={}", path));
    }

    for candidate in ["/etc/amoskys/fusion.yml", "fusion.yml"] {
      if std::path::Path::new(candidate).exists() {
        return Self::from_file(candidate)
          .with_context(|| format!("loading config from {}", candidate));
      }
    }

    bail!("no configuration found; set AMOSKYS_FUSION_CONFIG or provide fusion.yml")
  }

  pub fn from_file(path: &str) -> Result<Self> {
    let text = std::fs::read_to_string(path)?;
    let config: Self = serde_yaml::from_str(&text)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.engine.window_minutes == 0 {
      bail!("window_minutes must be positive");
    }
    if self.engine.eval_interval_seconds == 0 {
      bail!("eval_interval_seconds must be positive");
    }
    if self.engine.per_device_event_cap == 0 {
      bail!("per_device_event_cap must be positive");
    }
    Ok(())
  }

  pub fn window_ns(&self) -> i64 {
    (self.engine.window_minutes as i64) * 60 * 1_000_000_000
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn minimal_config_parses_with_defaults() {
    let yaml = r#"
engine:
  db_path: "/var/lib/amoskys/fusion.db"
  event_store_path: "/var/lib/amoskys/events.db"
"#;
    let config: FusionConfig = serde_yaml::from_str(yaml).unwrap();
    config.validate().unwrap();

    assert_eq!(config.engine.window_minutes, 30);
    assert_eq!(config.engine.eval_interval_seconds, 60);
    assert!(config.rules.flow_whitelist.is_empty());
    assert!(config
      .rules
      .suspicious_process_prefixes
      .contains(&"/tmp/".to_string()));
  }

  #[test]
  fn zero_window_is_rejected() {
    let yaml = r#"
engine:
  db_path: "fusion.db"
  event_store_path: "events.db"
  window_minutes: 0
"#;
    let config: FusionConfig = serde_yaml::from_str(yaml).unwrap();
    assert!(config.validate().is_err());
  }
}
