use crate::error::AgentError;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus exporter for an embedding agent process and
/// pre-register the SDK metric set.
pub async fn init_metrics(bind_address: SocketAddr) -> Result<(), AgentError> {
  register_agent_metrics();

  PrometheusBuilder::new()
    .with_http_listener(bind_address)
    .install()
    .map_err(|e| AgentError::Config(format!("Failed to install Prometheus exporter: {}", e)))?;

  info!("Prometheus metrics server started on {}", bind_address);
  Ok(())
}

fn register_agent_metrics() {
  gauge!("wal_depth").set(0.0);
  gauge!("wal_bytes").set(0.0);
  for outcome in [
    "ok",
    "retry",
    "overload",
    "invalid",
    "transport_error",
    "permanent_error",
  ] {
    counter!("publish_attempts_total", "outcome" => outcome).absolute(0);
  }
  histogram!("publish_latency_seconds").record(0.0);
  for reason in ["invalid", "decode_error", "permanent_error"] {
    counter!("dead_letter_total", "reason" => reason).absolute(0);
  }
  counter!("wal_dropped_total").absolute(0);
  counter!("wal_backpressure_blocks_total").absolute(0);
}
