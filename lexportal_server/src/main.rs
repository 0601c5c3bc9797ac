//! LexPortal Server - API edge with abuse protection
//!
//! This server handles:
//! - Sensitive-path probe detection and timed IP bans
//! - Shared ban state through Redis (in-memory fallback)
//! - Guard administration endpoints

mod abuse;
mod config;
mod redis;
mod routes;

use abuse::{AbuseGuard, LocalViolationStore, RedisViolationStore, ViolationStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lexportal_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::from_env()?;
    tracing::info!("Starting LexPortal server on {}:{}", config.host, config.port);

    let store = init_store(config.redis_url.as_deref()).await;
    let guard = AbuseGuard::new(&config.abuse, store);
    if !config.abuse.enabled {
        tracing::warn!("Abuse guard disabled by ABUSE_ENABLED");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweeper = abuse::spawn_sweeper(guard.clone(), config.abuse.sweep_interval, shutdown_rx);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let app = routes::router(routes::AppState::new(config, guard));

    tracing::info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::error!("Sweeper task failed: {}", e);
    }

    Ok(())
}

/// Pick the violation store: Redis when configured and reachable
async fn init_store(redis_url: Option<&str>) -> Arc<dyn ViolationStore> {
    let Some(url) = redis_url else {
        tracing::info!("REDIS_URL not set, tracking violations in memory");
        return Arc::new(LocalViolationStore::new());
    };

    tracing::info!("Connecting to Redis...");
    match redis::init_client(url).await {
        Ok(client) => Arc::new(RedisViolationStore::new(client)),
        Err(e) => {
            tracing::warn!("Redis unavailable ({}), falling back to in-memory tracking", e);
            Arc::new(LocalViolationStore::new())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
