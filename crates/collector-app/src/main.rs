use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use collector_app::{build_collector, build_router, AppState, CollectorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = CollectorConfig::load()?;
    config.validate()?;

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let collector = build_collector(&config).await?;
    let router = build_router(AppState { connections: collector.connections.clone(), prometheus_handle });

    let listener = tokio::net::TcpListener::bind(&config.http_bind_address).await?;
    tracing::info!(bind = %config.http_bind_address, "http surface listening");

    notify_systemd_ready();

    let scheduler = collector.scheduler.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, closing scheduler");
        scheduler.close().await;
    });

    server.await?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn notify_systemd_ready() {
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);
}

#[cfg(not(target_os = "linux"))]
fn notify_systemd_ready() {}
