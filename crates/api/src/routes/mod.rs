//! Route definitions.

pub mod ops;
pub mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(ops::health))
        .route("/webhooks/billing", post(webhooks::receive_event))
        .route("/ops/summary", get(ops::summary))
        .route("/ops/entitlements/{account_id}", get(ops::entitlement))
        .with_state(state)
}
