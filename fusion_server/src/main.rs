use anyhow::{Context, Result};
use fusion_server::observability::{self, HealthState};
use fusion_server::{FusionConfig, FusionDriver};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{
  fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer as _,
};

#[tokio::main]
async fn main() -> Result<()> {
  let env_filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new("info,fusion_server=debug"));

  let layer = Layer::new()
    .with_target(true)
    .with_file(true)
    .with_line_number(true)
    .with_filter(env_filter);

  tracing_subscriber::registry().with(layer).init();

  info!("Starting Fusion Engine v{}", env!("CARGO_PKG_VERSION"));

  let config = FusionConfig::load().map_err(|e| {
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

  let health_addr = config.observability.health_address.clone();
  info!(
    window_minutes = config.engine.window_minutes,
    eval_interval_seconds = config.engine.eval_interval_seconds,
    "Fusion engine configured"
  );

  let driver = FusionDriver::new(config).await.map_err(|e| {
    error!("Failed to initialize fusion driver: {}", e);
    anyhow::anyhow!(e.to_string())
  })?;

  {
    let app = observability::health_router(HealthState {
      store: driver.store().clone(),
      event_store: driver.event_store().clone(),
    });
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

  let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("Shutdown signal received, initiating graceful shutdown...");
      let _ = shutdown_tx.send(());
    }
  });

  driver.run(shutdown_rx).await;

  info!("Fusion Engine shutdown complete");
  Ok(())
}
