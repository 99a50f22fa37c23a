//! Storage traits for the synchronization engine.
//!
//! The engine owns two tables (subscriptions and the event ledger) plus the
//! reconciliation run log, and reads the platform's accounts table. Postgres
//! implementations live in [`crate::postgres`]; an in-memory implementation
//! for tests lives in [`crate::memory`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::event::{PlanTier, Subscription, SubscriptionStatus};
use crate::reconcile::ReconciliationReport;

/// Terminal result of processing one event.
///
/// Duplicate deliveries of the same event id resolve to the stored value, so
/// every caller observes a structurally equal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed { retryable: bool, detail: String },
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed { .. } => "failed",
        }
    }
}

/// Result of the ordering-guarded write path.
///
/// Staleness is an expected no-op under reordering, not an error, so it is a
/// variant rather than an `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    SkippedStale,
}

/// Result of attempting to claim an event for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    /// This caller owns processing for the event.
    Claimed,
    /// A terminal outcome already exists; return it without side effects.
    Duplicate(Outcome),
    /// Another worker holds a live `processing` lease.
    Busy,
}

/// One row of the idempotency ledger.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerRecord {
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: OffsetDateTime,
    pub received_at: OffsetDateTime,
    pub outcome: String,
    pub retryable: bool,
    pub error_detail: Option<String>,
    pub processing_duration_ms: Option<i64>,
    pub processing_started_at: Option<OffsetDateTime>,
}

impl LedgerRecord {
    /// The stored outcome, if processing has reached a terminal state.
    pub fn terminal_outcome(&self) -> Option<Outcome> {
        match self.outcome.as_str() {
            "succeeded" => Some(Outcome::Succeeded),
            "failed" => Some(Outcome::Failed {
                retryable: self.retryable,
                detail: self
                    .error_detail
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            }),
            _ => None,
        }
    }
}

/// Aggregate view over the ledger for the operational surface.
#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub since: OffsetDateTime,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub processing: i64,
    pub mean_duration_ms: Option<f64>,
}

/// Stored summary of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationRun {
    pub id: Uuid,
    pub started_at: OffsetDateTime,
    pub duration_ms: i64,
    pub pages: i32,
    pub partial: bool,
    pub created: i32,
    pub updated: i32,
    pub unchanged: i32,
    pub flagged: i32,
    pub errors: i32,
}

/// Durable table of subscription entities keyed by provider subscription id.
///
/// Rows are mutated only through [`apply_if_newer`](Self::apply_if_newer);
/// everything else is read-only.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, subscription_id: &str) -> SyncResult<Option<Subscription>>;

    /// The single ordering-guarded write path: insert-if-absent, or replace
    /// the row when the candidate's `source_event_timestamp` is strictly
    /// newer than the stored one. Atomic with respect to concurrent callers
    /// for the same subscription id.
    async fn apply_if_newer(&self, candidate: &Subscription) -> SyncResult<ApplyOutcome>;

    /// All locally known subscription ids (reconciliation diffs against it).
    async fn list_ids(&self) -> SyncResult<Vec<String>>;

    /// Resolve a local account by the provider's customer identifier.
    async fn find_account_by_customer(&self, external_customer_id: &str)
        -> SyncResult<Option<Uuid>>;

    /// Read-only view for tier-gating consumers.
    async fn entitlement(
        &self,
        account_id: Uuid,
    ) -> SyncResult<Option<(SubscriptionStatus, PlanTier)>>;
}

/// Durable record of every event's processing outcome, keyed by provider
/// event id. The insert-if-absent claim is the engine's only synchronization
/// primitive for duplicate deliveries.
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Atomically claim the event for processing.
    ///
    /// Reclaims are allowed for rows whose `processing` lease is older than
    /// `lease` (crashed or timed-out worker) and for failures marked
    /// retryable (redelivery is the retry mechanism). A successful or
    /// non-retryable terminal row is returned as [`ClaimDecision::Duplicate`].
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        occurred_at: OffsetDateTime,
        lease: Duration,
    ) -> SyncResult<ClaimDecision>;

    /// Write the terminal outcome for a claimed event.
    async fn complete(
        &self,
        event_id: &str,
        outcome: &Outcome,
        duration: Duration,
    ) -> SyncResult<()>;

    async fn get(&self, event_id: &str) -> SyncResult<Option<LedgerRecord>>;
}

/// Append-only operational record: processing outcomes are readable in
/// aggregate and every reconciliation pass is logged. Not part of the
/// transactional path.
#[async_trait]
pub trait OutcomeLog: Send + Sync {
    async fn record_reconciliation(&self, report: &ReconciliationReport) -> SyncResult<()>;

    async fn event_summary(&self, since: OffsetDateTime) -> SyncResult<EventSummary>;

    async fn recent_reconciliations(&self, limit: i64) -> SyncResult<Vec<ReconciliationRun>>;
}
