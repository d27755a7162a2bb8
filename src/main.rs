//! Beacon Server
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - BEACON_HOST: Bind address (default: 0.0.0.0)
//! - BEACON_PORT: Port number (default: 8080)
//! - BEACON_RULES_FILE: JSON array of rules loaded at startup
//! - BEACON_WEBHOOK_URLS: Comma-separated webhook endpoints for alert transitions
//! - BEACON_SECRET_<REF>_USERNAME / BEACON_SECRET_<REF>_PASSWORD: Backend credentials
//! - RUST_LOG: Log level (default: info)
//!
//! See `beacon::config` for the scheduler, pool and dispatch settings.

use std::sync::Arc;

use beacon::alerts::{LogSink, NotificationSink, WebhookSink};
use beacon::api::{run_server, ServerConfig};
use beacon::connector::EnvSecretResolver;
use beacon::{AlertEngine, EngineConfig, Identity};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server_config = ServerConfig::from_env();
    let config = EngineConfig::from_env();
    config.validate()?;

    tracing::info!("Beacon configuration:");
    tracing::info!("  Host: {}:{}", server_config.host, server_config.port);
    tracing::info!("  Tick: {} ms", config.scheduler.tick.as_millis());
    tracing::info!(
        "  Workers: {} (per target: {})",
        config.scheduler.max_workers,
        config.scheduler.per_target_concurrency
    );
    tracing::info!(
        "  Pool: {} connections, acquire timeout {} ms",
        config.pool.max_connections,
        config.pool.acquire_timeout.as_millis()
    );
    tracing::info!("  Connector timeout: {} ms", config.connector_timeout.as_millis());
    tracing::info!(
        "  Dispatch: {} attempts, initial backoff {} ms",
        config.retry.max_attempts,
        config.retry.initial_backoff.as_millis()
    );

    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
    for url in &config.webhook_urls {
        tracing::info!("  Webhook: {}", url);
        sinks.push(Arc::new(WebhookSink::new(url.clone())));
    }

    let rules_file = config.rules_file.clone();
    let engine = Arc::new(AlertEngine::new(
        config,
        Arc::new(EnvSecretResolver::new()),
        sinks,
    ));

    if let Some(path) = rules_file {
        let loaded = engine.load_rules_file(&Identity::admin("system"), &path)?;
        tracing::info!("  Rules: {} loaded from {}", loaded, path.display());
    } else {
        tracing::info!("  Rules: none (BEACON_RULES_FILE not set)");
    }

    println!(
        r#"
  ____
 |  _ \
 | |_) | ___  __ _  ___ ___  _ __
 |  _ < / _ \/ _` |/ __/ _ \| '_ \
 | |_) |  __/ (_| | (_| (_) | | | |
 |____/ \___|\__,_|\___\___/|_| |_|

 Multi-Backend Alert Rule Evaluation Engine
 Version: {}
"#,
        env!("CARGO_PKG_VERSION")
    );

    run_server(server_config, engine).await
}
