//! CodeCollab Server - real-time collaborative code editing
//!
//! Serves:
//! - Automerge document sync over binary WebSocket frames
//! - Presence (cursors, participants) over a separate JSON socket
//! - Session, file and version control endpoints over HTTP

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use codecollab::app::{self, AppState};
use codecollab::sync::protocol::PROTOCOL_VERSION;
use codecollab::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codecollab=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    let state = Arc::new(AppState::from_config(&config));

    let server = state.server().clone();
    let background = server.clone().start_background_tasks();

    let app = app::router(state);
    let addr = config.addr();

    info!("CodeCollab server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   Sync: ws://{}/ws/:session_id", addr);
    info!("   Presence: ws://{}/presence/:session_id", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            server.shutdown();
        })
        .await
        .context("Server error")?;

    background.wait().await;
    info!("Background tasks stopped");
    Ok(())
}
