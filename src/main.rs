use anyhow::{Context, Result};
use energy_telemetry_hub::{api, config, controller, domain, repo, telemetry};
use config::Config;
use repo::{SqliteStore, TelemetryStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;
    telemetry::init_tracing(&cfg.logging);

    let devices = domain::load_devices(&cfg.devices.config_file)?;

    let sqlite = Arc::new(
        SqliteStore::connect(&cfg.storage)
            .await
            .context("opening telemetry store")?,
    );
    let store: Arc<dyn TelemetryStore> = sqlite.clone();

    let (state, worker) = controller::AppState::new(cfg.clone(), store, devices);

    let report = state.schema.reconcile(&state.devices).await;
    for failure in &report.failed {
        warn!(device = %failure.device, reason = %failure.reason, "device has no table");
    }

    let shutdown = CancellationToken::new();
    let tasks = controller::spawn_background_tasks(&state, worker, shutdown.clone());

    let app = api::router(state);
    let addr = cfg.server.socket_addr()?;
    info!(%addr, "starting energy telemetry hub");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    info!("http server stopped, draining ingest queue");
    shutdown.cancel();
    tasks.wait().await;
    sqlite.close().await;

    info!("shutdown complete");
    Ok(())
}
