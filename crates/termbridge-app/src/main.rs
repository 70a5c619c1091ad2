use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use termbridge::{
    logging, BridgeConfig, Cli, ConfiguredCommand, WebServer, WebServerConfig,
};
use termbridge_terminal::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Some(shell) = cli.generate {
        Cli::print_completions(shell, &mut std::io::stdout());
        return Ok(());
    }

    logging::init(cli.log_level.as_deref())?;

    let config = BridgeConfig::resolve(&cli).context("Invalid configuration")?;
    let spawn_spec = config.spawn_spec();
    info!(
        command = %spawn_spec.display(),
        idle_timeout_secs = config.idle_timeout_secs,
        ring_buffer_bytes = config.ring_buffer_bytes,
        workers = config.worker_pool_size,
        "starting termbridge"
    );

    let manager = SessionManager::new(config.manager_config())
        .context("Invalid input validator rules")?;
    let resolver = Arc::new(ConfiguredCommand::new(spawn_spec));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));

    let server = WebServer::new(
        WebServerConfig {
            bind_addr: config.bind_addr,
            sweep_interval: config.sweep_interval(),
        },
        manager,
        resolver,
    );
    server.start(shutdown).await
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
