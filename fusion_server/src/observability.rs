use crate::error::FusionError;
use crate::store::FusionStore;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use eventbus_server::EventStore;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

pub async fn init_metrics(bind_address: SocketAddr) -> Result<(), FusionError> {
  register_fusion_metrics();

  PrometheusBuilder::new()
    .with_http_listener(bind_address)
    .install()
    .map_err(|e| {
      FusionError::Any(anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))
    })?;

  info!("Prometheus metrics server started on {}", bind_address);
  Ok(())
}

fn register_fusion_metrics() {
  for event_type in ["SECURITY", "AUDIT", "PROCESS", "FLOW", "METRIC"] {
    counter!("events_ingested_total", "event_type" => event_type).absolute(0);
  }
  for rule in [
    "ssh_brute_force",
    "persistence_after_auth",
    "suspicious_sudo",
    "multi_tactic_attack",
  ] {
    counter!("rule_evaluations_total", "rule" => rule).absolute(0);
    counter!("rule_errors_total", "rule" => rule).absolute(0);
  }
  counter!("incidents_emitted_total", "rule" => "", "severity" => "").absolute(0);
  gauge!("window_size_events", "device" => "").set(0.0);
  counter!("window_overflow_drops_total").absolute(0);
}

#[derive(Clone)]
pub struct HealthState {
  pub store: FusionStore,
  pub event_store: EventStore,
}

pub fn health_router(state: HealthState) -> Router {
  Router::new()
    .route("/live", get(liveness_handler))
    .route("/ready", get(readiness_handler))
    .layer(tower_http::trace::TraceLayer::new_for_http())
    .with_state(state)
}

async fn liveness_handler() -> Json<serde_json::Value> {
  Json(serde_json::json!({
      "status": "alive",
      "timestamp": chrono::Utc::now()
  }))
}

async fn readiness_handler(
  State(state): State<HealthState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
  let store_ok = state.store.healthy().await;
  let events_ok = state.event_store.healthy().await;

  if store_ok && events_ok {
    Ok(Json(serde_json::json!({
        "status": "ready",
        "checks": {
            "incident_store": "ok",
            "event_store": "ok"
        }
    })))
  } else {
    Err((
      StatusCode::SERVICE_UNAVAILABLE,
      Json(serde_json::json!({
          "status": "not_ready",
          "checks": {
              "incident_store": if store_ok { "ok" } else { "fail" },
              "event_store": if events_ok { "ok" } else { "fail" }
          }
      })),
    ))
  }
}
