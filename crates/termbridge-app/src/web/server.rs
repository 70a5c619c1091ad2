use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use termbridge_terminal::SessionManager;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::resolver::SpawnResolver;
use crate::web::routes::{self, AppState};

/// Web server configuration
#[derive(Debug, Clone)]
pub struct WebServerConfig {
    pub bind_addr: SocketAddr,
    pub sweep_interval: Duration,
}

/// Web server instance
pub struct WebServer {
    config: WebServerConfig,
    manager: SessionManager,
    resolver: Arc<dyn SpawnResolver>,
}

impl WebServer {
    pub fn new(
        config: WebServerConfig,
        manager: SessionManager,
        resolver: Arc<dyn SpawnResolver>,
    ) -> Self {
        Self {
            config,
            manager,
            resolver,
        }
    }

    /// Router with tracing and permissive CORS
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: self.manager.clone(),
            resolver: Arc::clone(&self.resolver),
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        routes::create_router(state)
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_addr))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires, then
    /// terminate every session.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr().context("Failed to read listener address")?;
        let sweeper = self
            .manager
            .spawn_sweeper(self.config.sweep_interval, shutdown.child_token());

        info!("Web server listening on http://{}", addr);
        info!("WebSocket endpoint: ws://{}/ws/{{session_key}}", addr);

        let app = self.router();
        let signal = shutdown.clone();
        let manager = self.manager.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.cancelled().await;
                info!("Shutting down, terminating all sessions");
                // Open WebSockets close once their sessions report closed.
                manager.shutdown().await;
            })
            .await
            .context("HTTP server error");

        shutdown.cancel();
        self.manager.shutdown().await;
        if let Err(e) = sweeper.await {
            warn!("Idle sweeper task failed: {}", e);
        }
        info!("Web server stopped");
        served
    }
}
