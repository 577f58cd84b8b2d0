use crate::AppState;
use axum::{
  extract::State,
  http::StatusCode,
  response::Json,
  routing::get,
  Router,
};
use std::sync::atomic::Ordering;
use tower_http::trace::TraceLayer;

pub fn health_router(state: AppState) -> Router {
  Router::new()
    .route("/live", get(liveness_handler))
    .route("/ready", get(readiness_handler))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// Liveness: the process is responsive.
async fn liveness_handler() -> Json<serde_json::Value> {
  Json(serde_json::json!({
      "status": "alive",
      "timestamp": chrono::Utc::now()
  }))
}

/// Readiness: the store is writable, the trust map is loaded, and the last
/// writes have not been failing.
async fn readiness_handler(
  State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
  let store_ok = state.store.healthy().await;
  let trust_ok = !state.trust.snapshot().is_empty();
  let writes_ok = state.ready.load(Ordering::Acquire);

  if store_ok && trust_ok && writes_ok {
    Ok(Json(serde_json::json!({
        "status": "ready",
        "checks": {
            "store": "ok",
            "trust_map": "ok"
        }
    })))
  } else {
    Err((
      StatusCode::SERVICE_UNAVAILABLE,
      Json(serde_json::json!({
          "status": "not_ready",
          "checks": {
              "store": if store_ok && writes_ok { "ok" } else { "fail" },
              "trust_map": if trust_ok { "ok" } else { "fail" }
          }
      })),
    ))
  }
}
