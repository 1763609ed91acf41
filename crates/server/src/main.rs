mod config;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    // Parse command-line args for config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/ratelab.yaml".to_string());

    info!(config_path = %config_path, "starting ratelab");

    let loaded = ServerConfig::load(&config_path)?;
    let listen = loaded.config.server.listen.clone();

    let state = ratelab_api::new_shared_state(loaded.config)?;
    for policy in state.engine.policies() {
        info!(policy = %policy.name, window_ms = policy.window.as_millis() as u64, "policy active");
    }

    let maintenance = state.engine.start_maintenance_task();

    let result = ratelab_api::run_server(state, &listen, shutdown_signal()).await;
    maintenance.abort();

    if let Err(ref e) = result {
        error!(error = %e, "server error");
    }
    info!("ratelab stopped");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
