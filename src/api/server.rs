use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{health_check, list_alerts, rule_status, stats, AppState};
use crate::engine::AlertEngine;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// BEACON_HOST / BEACON_PORT, falling back to 0.0.0.0:8080
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("BEACON_HOST").unwrap_or(defaults.host),
            port: std::env::var("BEACON_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
        }
    }
}

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Engine stats
        .route("/stats", get(stats))
        // Alert views
        .route("/alerts", get(list_alerts))
        .route("/rules/:id/status", get(rule_status))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Start the engine and serve the HTTP surface until Ctrl-C
pub async fn run_server(
    config: ServerConfig,
    engine: Arc<AlertEngine>,
) -> Result<(), Box<dyn std::error::Error>> {
    engine.start();

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
    });
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting Beacon server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    tracing::info!("Beacon server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received, stopping engine...");
}
