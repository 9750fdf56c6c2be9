// Declare the modules
pub mod api;
pub mod config;
pub mod decoder;
pub mod error;
pub mod models;
pub mod reducer;
pub mod retry;
pub mod routes;
pub mod session;
pub mod state;
pub mod storage;
pub mod terminal;

use anyhow::Context;
use config::Config;
use state::AppState;
use std::sync::Arc;
use storage::{ChatStore, MemoryChatStore, SqliteChatStore};

/// Opens the conversation store named by `database_url` (`memory` or a sqlx SQLite URL).
pub async fn open_store(database_url: &str) -> anyhow::Result<Arc<dyn ChatStore>> {
    if database_url == "memory" {
        log::warn!("Using in-memory chat store; history is lost on exit.");
        return Ok(Arc::new(MemoryChatStore::new()));
    }
    let store = SqliteChatStore::connect(database_url).await?;
    Ok(Arc::new(store))
}

/// Runs the HTTP server until Ctrl-C.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config.database_url).await?;
    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, store);
    let app = routes::build(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    log::info!("HTTP server listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    log::info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Failed to install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}
