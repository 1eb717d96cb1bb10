//! Agent session gateway.
//!
//! Run with: cargo run -p gateway-server
//!
//! Configuration is read from `$GATEWAY_CONFIG` or `<data_dir>/config.json`;
//! `GATEWAY_LISTEN` and `GATEWAY_DATA_DIR` override the file.

mod config;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use gateway_session::{SessionManager, SessionStore};
use gateway_transport::{AppState, StaticBlocklist, router};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::GatewayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = GatewayConfig::load()?;
    let store = SessionStore::open_dir(config.sessions_dir())
        .await
        .with_context(|| format!("Failed to open session store in {}", config.data_dir.display()))?
        .with_lock_policy(config.lock_policy());

    let servers = config.agent_servers();
    tracing::info!(servers = ?servers.names(), "Registered agent servers");

    let manager = Arc::new(
        SessionManager::new(store, Arc::new(servers), config.session_config()).with_hooks(config.message_hooks()),
    );
    let rehydrated = manager.rehydrate().await.context("Failed to load persisted sessions")?;
    tracing::info!("Indexed {rehydrated} persisted sessions");
    manager.start_reaper();

    let state = AppState {
        manager: Arc::clone(&manager),
        guard: Arc::new(StaticBlocklist::new(config.blocked_origins.iter().copied())),
    };
    let app = router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    tracing::info!("Gateway listening on http://{}", config.listen);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down sessions");
    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
}
