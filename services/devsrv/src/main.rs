//! devsrv entry point

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use devsrv::api::{self, AppState};
use devsrv::core::transport::DefaultTransportFactory;
use devsrv::core::{MemoryRepository, PollingRegistry, SessionManager, SessionSettings};
use devsrv::GatewayConfig;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Industrial Modbus device gateway")]
struct Args {
    /// JSON file with an array of device definitions to preload
    #[clap(short, long, value_parser)]
    devices: Option<PathBuf>,

    /// Override the HTTP bind address (host:port)
    #[clap(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = GatewayConfig::load().context("loading gateway configuration")?;
    info!(?config, "Starting device gateway");

    let repository = Arc::new(MemoryRepository::new());
    if let Some(path) = &args.devices {
        repository
            .load_json_file(path)
            .context("loading device definitions")?;
    }

    let sessions = SessionManager::new(
        Box::new(DefaultTransportFactory),
        SessionSettings {
            idle_ttl: config.session_idle_ttl(),
            reap_interval: config.reap_interval(),
            default_timeout_ms: config.default_timeout_ms,
        },
    );
    let registry = PollingRegistry::new(repository, Arc::clone(&sessions), config.clone());

    let bind = args
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.http_host, config.http_port));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "HTTP API listening");

    let app = api::router(AppState::new(Arc::clone(&registry)));
    axum::serve(listener, app)
        .with_graceful_shutdown(devsrv::util::shutdown::wait_for_shutdown())
        .await
        .context("serving HTTP API")?;

    info!("Shutdown signal received, stopping pollers");
    let stragglers = registry.shutdown(config.shutdown_grace()).await;
    if !stragglers.is_empty() {
        warn!(?stragglers, "Some pollers missed the shutdown deadline");
    }

    info!("Device gateway stopped");
    Ok(())
}
