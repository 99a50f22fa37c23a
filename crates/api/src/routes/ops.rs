//! Read-only operational surface.
//!
//! Consumed by monitoring and by tier-gating readers. Nothing here writes:
//! subscription rows are mutated only through the engine's guarded path.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    #[serde(default = "default_window_hours")]
    window_hours: i64,
}

fn default_window_hours() -> i64 {
    24
}

/// Processing counts plus recent reconciliation runs.
pub async fn summary(
    State(state): State<AppState>,
    Query(params): Query<SummaryParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let since = OffsetDateTime::now_utc() - time::Duration::hours(params.window_hours);
    let events = state.engine.outcomes.event_summary(since).await?;
    let reconciliations = state.engine.outcomes.recent_reconciliations(10).await?;

    Ok(Json(serde_json::json!({
        "events": events,
        "reconciliations": reconciliations,
    })))
}

/// Tier-gating view: status and plan tier only.
pub async fn entitlement(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.engine.store.entitlement(account_id).await? {
        Some((status, plan_tier)) => Ok(Json(serde_json::json!({
            "account_id": account_id,
            "status": status,
            "plan_tier": plan_tier,
        }))),
        None => Err(ApiError::not_found("no subscription for account")),
    }
}
