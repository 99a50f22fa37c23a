//! billsync API Server
//!
//! Hosts the inbound webhook endpoint and the read-only operational
//! surface. All synchronization logic lives in `billsync-engine`; this
//! binary is HTTP plumbing around it.

mod config;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use billsync_engine::SyncEngine;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,billsync_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting billsync API server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = billsync_shared::create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    billsync_shared::run_migrations(&pool).await?;

    let engine = Arc::new(SyncEngine::from_env(pool.clone())?);
    tracing::info!("Synchronization engine initialized");

    let state = AppState::new(pool, engine);

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
