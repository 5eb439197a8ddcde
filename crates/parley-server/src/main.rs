//! # parley-server
//!
//! Real-time direct-messaging backend.
//!
//! This binary provides:
//! - **REST API** (axum) for accounts, user search, chat requests,
//!   conversation listings and message history
//! - **WebSocket gateway** that routes messages, receipts, typing
//!   indicators and presence between connected sessions
//! - **SQLite message log** holding users, conversations, messages and
//!   chat requests
//! - **Per-IP and per-user rate limiting** to protect against abuse

mod api;
mod auth;
mod config;
mod error;
mod events;
mod gateway;
mod presence;
mod rate_limit;
mod registry;
mod router;

use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_shared::TokenSigner;
use parley_store::{Database, SharedDatabase};

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug,parley_store=debug")),
        )
        .init();

    info!("Starting Parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let database = Database::open_at(&config.database_path)?;
    let db = SharedDatabase::new(database);

    let ttl = chrono::Duration::hours(config.session_ttl_hours);
    let signer = match config.session_signing_key {
        Some(secret) => TokenSigner::from_secret_bytes(&secret, ttl),
        None => {
            warn!("SESSION_SIGNING_KEY not set; using a random key, sessions end on restart");
            TokenSigner::generate(ttl)
        }
    };

    let http_addr = config.http_addr;
    let app_state = AppState::new(config, db, signer);
    let presence = app_state.presence.clone();

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let http_limiter = app_state.http_limiter.clone();
    let event_limiter = app_state.event_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            http_limiter.purge_stale(600.0).await;
            event_limiter.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // Close every open socket and record those users as offline.
    presence.shutdown().await;

    Ok(())
}
