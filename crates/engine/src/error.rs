//! Error types for the synchronization engine.

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Why an inbound request failed authentication or decoding.
///
/// All variants are terminal for the request: the caller rejects it and the
/// provider must not interpret the rejection as a transient failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("webhook signature mismatch")]
    SignatureMismatch,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error("webhook timestamp outside tolerance window ({age_secs}s old, tolerance {tolerance_secs}s)")]
    StaleTimestamp { age_secs: i64, tolerance_secs: i64 },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error("database error: {0}")]
    Database(String),

    #[error("provider api error: {0}")]
    Provider(String),

    #[error("provider rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("event {0} is being processed by another worker")]
    AlreadyProcessing(String),

    #[error("processing deadline of {0}ms exceeded")]
    DeadlineExceeded(u64),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("no account found for billing customer {0}")]
    UnknownAccount(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether a retry (provider redelivery or the next scheduled tick) can
    /// plausibly succeed. Data errors deterministically fail again and are
    /// surfaced for manual follow-up instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Database(_)
                | SyncError::Provider(_)
                | SyncError::RateLimited { .. }
                | SyncError::AlreadyProcessing(_)
                | SyncError::DeadlineExceeded(_)
        )
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SyncError::Database("down".into()).is_transient());
        assert!(SyncError::RateLimited {
            retry_after_secs: Some(30)
        }
        .is_transient());
        assert!(SyncError::DeadlineExceeded(10_000).is_transient());
        assert!(!SyncError::UnknownEventType("invoice.paid".into()).is_transient());
        assert!(!SyncError::MissingField("status").is_transient());
        assert!(!SyncError::Verification(VerificationError::SignatureMismatch).is_transient());
    }
}
