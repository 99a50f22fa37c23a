//! Application state

use std::sync::Arc;

use billsync_engine::SyncEngine;
use sqlx::PgPool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(pool: PgPool, engine: Arc<SyncEngine>) -> Self {
        Self { pool, engine }
    }
}
