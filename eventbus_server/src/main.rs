use amoskys_protos::amoskys::v1::event_bus_server::EventBusServer;
use anyhow::{Context, Result};
use eventbus_server::service::EventBusService;
use eventbus_server::{health, observability, tls, AppState, BusConfig};
use metrics::counter;
use std::time::Duration;
use tokio::net::TcpListener;
use tonic::transport::Server;
use tracing::{error, info, warn};
use tracing_subscriber::{
  fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer as _,
};

#[tokio::main]
async fn main() -> Result<()> {
  let env_filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new("info,eventbus_server=debug"));

  let layer = Layer::new()
    .with_target(true)
    .with_file(true)
    .with_line_number(true)
    .with_filter(env_filter);

  tracing_subscriber::registry().with(layer).init();

  info!("Starting EventBus v{}", env!("CARGO_PKG_VERSION"));

  let config = BusConfig::load().map_err(|e| {
    error!("Failed to load configuration: {}", e);
    e
  })?;

  let metrics_addr = config
    .observability
    .metrics_address
    .parse()
    .context("parsing metrics_address")?;
  if let Err(e) = observability::init_metrics(metrics_addr).await {
    error!("Failed to initialize observability: {}", e);
    warn!("Continuing without Prometheus metrics export");
  }

  let listen_addr = config
    .server
    .listen_address
    .parse()
    .context("parsing listen_address")?;
  let health_addr = config.observability.health_address.clone();
  let tls_enabled = config.tls.enabled;
  let retention_hours = config.server.retention_hours;
  let sweep_interval = Duration::from_secs(config.server.retention_sweep_seconds);
  let trust_reload = Duration::from_secs(config.trust.reload_seconds);

  let state = AppState::try_new(config).await.map_err(|e| {
    error!("Failed to initialize bus state: {}", e);
    anyhow::anyhow!(e.to_string())
  })?;

  // Trust map reloads publish fresh snapshots without a restart.
  state.trust.start_reload_task(trust_reload);

  // Retention sweep keeps the event store bounded.
  {
    let store = state.store.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(sweep_interval);
      loop {
        ticker.tick().await;
        let cutoff_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
          - (retention_hours as i64) * 3600 * 1_000_000_000;
        match store.prune_older_than(cutoff_ns).await {
          Ok(0) => {}
          Ok(pruned) => {
            counter!("events_pruned_total").increment(pruned);
            info!(pruned, "Retention sweep completed");
          }
          Err(e) => warn!("Retention sweep failed: {}", e),
        }
      }
    });
  }

  // Health endpoints live beside the metrics listener.
  {
    let app = health::health_router(state.clone());
    let listener = TcpListener::bind(&health_addr)
      .await
      .with_context(|| format!("binding health server to {}", health_addr))?;
    info!("Health endpoints available at http://{}/live and /ready", health_addr);
    tokio::spawn(async move {
      if let Err(e) = axum::serve(listener, app.into_make_service()).await {
        error!("Health server error: {}", e);
      }
    });
  }

  let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("Shutdown signal received, initiating graceful shutdown...");
      let _ = shutdown_tx.send(());
    }
  });

  let mut server = Server::builder();
  if tls_enabled {
    let tls_config = tls::server_tls_config(&state.config.tls)
      .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    server = server.tls_config(tls_config).context("applying TLS config")?;
    info!("Mutual TLS enabled on {}", listen_addr);
  } else {
    warn!("TLS disabled; accepting plaintext connections (development only)");
  }

  info!("EventBus listening on {}", listen_addr);

  server
    .add_service(EventBusServer::new(EventBusService::new(state)))
    .serve_with_shutdown(listen_addr, async move {
      let _ = shutdown_rx.recv().await;
      info!("gRPC server shutting down...");
    })
    .await
    .context("gRPC server error")?;

  info!("EventBus shutdown complete");
  Ok(())
}
