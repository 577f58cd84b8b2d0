use crate::BusError;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus exporter and pre-register the bus metric set so
/// dashboards see zeroed series before the first publish arrives.
pub async fn init_metrics(bind_address: SocketAddr) -> Result<(), BusError> {
  register_bus_metrics();

  PrometheusBuilder::new()
    .with_http_listener(bind_address)
    .install()
    .map_err(|e| BusError::Any(anyhow::anyhow!("Failed to install Prometheus exporter: {}", e)))?;

  info!("Prometheus metrics server started on {}", bind_address);
  Ok(())
}

fn register_bus_metrics() {
  for status in ["ok", "retry", "invalid", "overload"] {
    counter!("received_total", "status" => status, "agent" => "").absolute(0);
  }
  gauge!("inflight").set(0.0);
  counter!("signature_failures_total", "agent" => "").absolute(0);
  counter!("overload_rejections_total").absolute(0);
  histogram!("store_latency_seconds").record(0.0);
  counter!("dedup_hits_total").absolute(0);
  counter!("clock_skew_flagged_total").absolute(0);
  counter!("events_pruned_total").absolute(0);
  counter!("trust_map_reload_errors_total").absolute(0);
}
