//! Fleet server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use fleet_core::config::AppConfig;
use fleet_server::{AppState, create_router};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// fleetd - node protocol server for osquery-style agents
#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FLEET_CONFIG", default_value = "config/server.toml")]
    config: String,
}

/// Load configuration from an optional TOML file and `FLEET_` variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("FLEET_") && key != "FLEET_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: fleetd --config /path/to/config.toml\n  \
             2. Environment variables: FLEET_SERVER__BIND=0.0.0.0:8080 \
             FLEET_SERVER__NODE_KEY_SECRET=... fleetd\n\n\
             Set FLEET_CONFIG to specify a default config file path."
        );
    }

    figment
        .merge(Env::prefixed("FLEET_").split("__"))
        .extract()
        .context("failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("fleetd v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    fleet_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = fleet_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Object store ready");

    let metadata = fleet_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let state = AppState::new(config.clone(), storage, metadata)
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    let loaded = state
        .environments
        .refresh()
        .await
        .context("failed to load environments")?;
    tracing::info!(environments = loaded, "Environments loaded");

    // Handles are kept for the life of the process.
    let _background = [
        state
            .environments
            .clone()
            .spawn_refresh(config.server.env_refresh_interval()),
        state.dispatcher.clone().spawn_maintenance(),
        state.tasks.clone().spawn_watchdog(),
    ];

    if let Some(cleanup_interval) = state.rate_limit_cleanup_interval() {
        fleet_server::ratelimit::spawn_cleanup_task(state.rate_limit.clone(), cleanup_interval);
        tracing::info!(
            interval_secs = cleanup_interval.as_secs(),
            "Rate limiter cleanup task spawned"
        );
    }

    let writer = state.writer.clone();
    let tasks = state.tasks.clone();
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutting down");
    writer.shutdown().await;
    let aborted = tasks.drain(config.server.shutdown_grace()).await;
    tracing::info!(aborted, "Background tasks drained");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_from_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "0.0.0.0:9000"
node_key_secret = "file-node-key-secret-0123456789abcdef"

[writer]
batch_size = 10

[log_sink]
type = "stdout"
"#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.writer.batch_size, 10);
        assert_eq!(config.log_sink, fleet_core::config::LogSinkConfig::Stdout);
        assert!(config.validate().is_ok());
    }
}
