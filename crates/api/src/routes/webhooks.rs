//! Inbound webhook endpoint.
//!
//! The body is taken as raw bytes: signature verification depends on the
//! exact bytes as sent, so nothing may parse or re-serialize the payload
//! before the verifier has seen it.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use billsync_engine::Outcome;

use crate::state::AppState;

/// Header carrying `t=<unix>,v1=<hex hmac>`.
pub const SIGNATURE_HEADER: &str = "billing-signature";

/// Response code policy:
/// - 200: durably accepted, including stale no-ops and non-retryable data
///   errors (redelivery would deterministically fail again)
/// - 400: verification failure, the provider must not retry
/// - 503: transient failure, the provider should retry
fn status_for(outcome: &Outcome) -> StatusCode {
    match outcome {
        Outcome::Succeeded => StatusCode::OK,
        Outcome::Failed {
            retryable: true, ..
        } => StatusCode::SERVICE_UNAVAILABLE,
        Outcome::Failed {
            retryable: false, ..
        } => StatusCode::OK,
    }
}

pub async fn receive_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(signature) => signature,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "missing billing-signature header" })),
            )
                .into_response();
        }
    };

    let event = match state.engine.verifier.verify(&body, signature) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Webhook verification failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let outcome = state.engine.processor.process(&event).await;
    let status = status_for(&outcome);

    let body = match &outcome {
        Outcome::Succeeded => serde_json::json!({ "accepted": true }),
        Outcome::Failed { retryable, detail } => serde_json::json!({
            "accepted": false,
            "retryable": retryable,
            "detail": detail,
        }),
    };

    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeded_is_200() {
        assert_eq!(status_for(&Outcome::Succeeded), StatusCode::OK);
    }

    #[test]
    fn transient_failure_asks_for_redelivery() {
        let outcome = Outcome::Failed {
            retryable: true,
            detail: "database error: connection refused".to_string(),
        };
        assert_eq!(status_for(&outcome), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn data_error_stops_redelivery() {
        let outcome = Outcome::Failed {
            retryable: false,
            detail: "unknown event type: invoice.paid".to_string(),
        };
        assert_eq!(status_for(&outcome), StatusCode::OK);
    }
}
