//! Postgres implementations of the storage traits.
//!
//! The claim and the guarded upsert are single statements so the database's
//! unique constraints do the synchronization; no external locks, and no lock
//! is ever held across a network call.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::event::{PlanTier, Subscription, SubscriptionStatus};
use crate::reconcile::ReconciliationReport;
use crate::storage::{
    ApplyOutcome, ClaimDecision, EventLedger, EventSummary, LedgerRecord, Outcome, OutcomeLog,
    ReconciliationRun, SubscriptionStore,
};

type SubscriptionRow = (
    String,                // subscription_id
    Uuid,                  // account_id
    String,                // plan_tier
    String,                // status
    Option<OffsetDateTime>, // current_period_start
    Option<OffsetDateTime>, // current_period_end
    Option<OffsetDateTime>, // trial_end
    bool,                  // cancel_at_period_end
    Option<i64>,           // amount_cents
    Option<String>,        // currency
    Option<String>,        // billing_interval
    OffsetDateTime,        // source_event_timestamp
);

fn subscription_from_row(row: SubscriptionRow) -> SyncResult<Subscription> {
    let (
        subscription_id,
        account_id,
        plan_tier,
        status,
        current_period_start,
        current_period_end,
        trial_end,
        cancel_at_period_end,
        amount_cents,
        currency,
        billing_interval,
        source_event_timestamp,
    ) = row;

    Ok(Subscription {
        subscription_id,
        account_id,
        plan_tier: PlanTier::parse(&plan_tier)
            .ok_or_else(|| SyncError::Database(format!("unknown plan tier '{}'", plan_tier)))?,
        status: SubscriptionStatus::parse(&status)
            .ok_or_else(|| SyncError::Database(format!("unknown status '{}'", status)))?,
        current_period_start,
        current_period_end,
        trial_end,
        cancel_at_period_end,
        amount_cents,
        currency,
        billing_interval,
        source_event_timestamp,
    })
}

/// Subscription table access. All mutation goes through `apply_if_newer`.
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get(&self, subscription_id: &str) -> SyncResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, account_id, plan_tier, status,
                   current_period_start, current_period_end, trial_end,
                   cancel_at_period_end, amount_cents, currency, billing_interval,
                   source_event_timestamp
            FROM subscriptions
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(subscription_from_row).transpose()
    }

    async fn apply_if_newer(&self, candidate: &Subscription) -> SyncResult<ApplyOutcome> {
        // Insert-if-absent, or replace the row when the candidate's source
        // event timestamp is strictly newer. The WHERE clause on the upsert
        // makes the ordering guard race-free: a losing concurrent write
        // affects zero rows.
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, subscription_id, account_id, plan_tier, status,
                current_period_start, current_period_end, trial_end,
                cancel_at_period_end, amount_cents, currency, billing_interval,
                source_event_timestamp, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), NOW()
            )
            ON CONFLICT (subscription_id) DO UPDATE SET
                account_id = EXCLUDED.account_id,
                plan_tier = EXCLUDED.plan_tier,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                trial_end = EXCLUDED.trial_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                billing_interval = EXCLUDED.billing_interval,
                source_event_timestamp = EXCLUDED.source_event_timestamp,
                updated_at = NOW()
            WHERE subscriptions.source_event_timestamp < EXCLUDED.source_event_timestamp
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&candidate.subscription_id)
        .bind(candidate.account_id)
        .bind(candidate.plan_tier.as_str())
        .bind(candidate.status.as_str())
        .bind(candidate.current_period_start)
        .bind(candidate.current_period_end)
        .bind(candidate.trial_end)
        .bind(candidate.cancel_at_period_end)
        .bind(candidate.amount_cents)
        .bind(candidate.currency.as_ref())
        .bind(candidate.billing_interval.as_ref())
        .bind(candidate.source_event_timestamp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(ApplyOutcome::SkippedStale)
        } else {
            Ok(ApplyOutcome::Applied)
        }
    }

    async fn list_ids(&self) -> SyncResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT subscription_id FROM subscriptions")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn find_account_by_customer(
        &self,
        external_customer_id: &str,
    ) -> SyncResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM accounts WHERE external_customer_id = $1")
                .bind(external_customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn entitlement(
        &self,
        account_id: Uuid,
    ) -> SyncResult<Option<(SubscriptionStatus, PlanTier)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT status, plan_tier
            FROM subscriptions
            WHERE account_id = $1
            ORDER BY source_event_timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some((status, tier)) => {
                let status = SubscriptionStatus::parse(&status)
                    .ok_or_else(|| SyncError::Database(format!("unknown status '{}'", status)))?;
                let tier = PlanTier::parse(&tier)
                    .ok_or_else(|| SyncError::Database(format!("unknown plan tier '{}'", tier)))?;
                Ok(Some((status, tier)))
            }
        }
    }
}

/// Idempotency ledger over the `sync_events` table.
pub struct PgEventLedger {
    pool: PgPool,
}

impl PgEventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLedger for PgEventLedger {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        occurred_at: OffsetDateTime,
        lease: Duration,
    ) -> SyncResult<ClaimDecision> {
        // Atomic claim: the insert succeeds for the first delivery; the
        // conditional upsert reclaims rows whose processing lease expired
        // (crashed or timed-out worker) or whose failure was retryable.
        // Exactly one concurrent caller gets a row back.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO sync_events
                (id, event_id, event_type, occurred_at, outcome, retryable,
                 processing_started_at, received_at)
            VALUES ($1, $2, $3, $4, 'processing', FALSE, NOW(), NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                outcome = 'processing',
                retryable = FALSE,
                error_detail = NULL,
                processing_started_at = NOW()
            WHERE (sync_events.outcome = 'failed' AND sync_events.retryable)
               OR (sync_events.outcome = 'processing'
                   AND sync_events.processing_started_at < NOW() - ($5 * INTERVAL '1 second'))
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(event_type)
        .bind(occurred_at)
        .bind(lease.as_secs() as i64)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(ClaimDecision::Claimed);
        }

        let existing: Option<(String, bool, Option<String>)> = sqlx::query_as(
            "SELECT outcome, retryable, error_detail FROM sync_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some((outcome, _, _)) if outcome == "succeeded" => {
                Ok(ClaimDecision::Duplicate(Outcome::Succeeded))
            }
            Some((outcome, retryable, detail)) if outcome == "failed" && !retryable => {
                Ok(ClaimDecision::Duplicate(Outcome::Failed {
                    retryable: false,
                    detail: detail.unwrap_or_else(|| "unknown failure".to_string()),
                }))
            }
            // Live processing lease, a reclaim race, or a row we lost the
            // insert race to: someone else owns this event right now.
            _ => Ok(ClaimDecision::Busy),
        }
    }

    async fn complete(
        &self,
        event_id: &str,
        outcome: &Outcome,
        duration: Duration,
    ) -> SyncResult<()> {
        let (retryable, error_detail) = match outcome {
            Outcome::Succeeded => (false, None),
            Outcome::Failed { retryable, detail } => (*retryable, Some(detail.clone())),
        };

        sqlx::query(
            r#"
            UPDATE sync_events
            SET outcome = $2, retryable = $3, error_detail = $4, processing_duration_ms = $5
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome.as_str())
        .bind(retryable)
        .bind(error_detail)
        .bind(duration.as_millis() as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, event_id: &str) -> SyncResult<Option<LedgerRecord>> {
        let row: Option<(
            String,
            String,
            OffsetDateTime,
            OffsetDateTime,
            String,
            bool,
            Option<String>,
            Option<i64>,
            Option<OffsetDateTime>,
        )> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, occurred_at, received_at, outcome,
                   retryable, error_detail, processing_duration_ms, processing_started_at
            FROM sync_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(
                event_id,
                event_type,
                occurred_at,
                received_at,
                outcome,
                retryable,
                error_detail,
                processing_duration_ms,
                processing_started_at,
            )| LedgerRecord {
                event_id,
                event_type,
                occurred_at,
                received_at,
                outcome,
                retryable,
                error_detail,
                processing_duration_ms,
                processing_started_at,
            },
        ))
    }
}

/// Operational read/append surface over the ledger and reconciliation runs.
pub struct PgOutcomeLog {
    pool: PgPool,
}

impl PgOutcomeLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutcomeLog for PgOutcomeLog {
    async fn record_reconciliation(&self, report: &ReconciliationReport) -> SyncResult<()> {
        let report_json = serde_json::to_value(report)
            .map_err(|e| SyncError::Database(format!("report serialization failed: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO reconciliation_runs (
                id, started_at, duration_ms, pages, partial,
                created_count, updated_count, unchanged_count, flagged_count,
                error_count, report
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(report.started_at)
        .bind(report.duration_ms as i64)
        .bind(report.pages as i32)
        .bind(report.partial)
        .bind(report.created as i32)
        .bind(report.updated as i32)
        .bind(report.unchanged as i32)
        .bind(report.flagged_local_only.len() as i32)
        .bind(report.errors.len() as i32)
        .bind(report_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn event_summary(&self, since: OffsetDateTime) -> SyncResult<EventSummary> {
        let (total, succeeded, failed, processing, mean_duration_ms): (
            i64,
            i64,
            i64,
            i64,
            Option<f64>,
        ) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE outcome = 'succeeded'),
                   COUNT(*) FILTER (WHERE outcome = 'failed'),
                   COUNT(*) FILTER (WHERE outcome = 'processing'),
                   AVG(processing_duration_ms)::FLOAT8
            FROM sync_events
            WHERE received_at >= $1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(EventSummary {
            since,
            total,
            succeeded,
            failed,
            processing,
            mean_duration_ms,
        })
    }

    async fn recent_reconciliations(&self, limit: i64) -> SyncResult<Vec<ReconciliationRun>> {
        let rows: Vec<(
            Uuid,
            OffsetDateTime,
            i64,
            i32,
            bool,
            i32,
            i32,
            i32,
            i32,
            i32,
        )> = sqlx::query_as(
            r#"
            SELECT id, started_at, duration_ms, pages, partial,
                   created_count, updated_count, unchanged_count, flagged_count, error_count
            FROM reconciliation_runs
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    id,
                    started_at,
                    duration_ms,
                    pages,
                    partial,
                    created,
                    updated,
                    unchanged,
                    flagged,
                    errors,
                )| ReconciliationRun {
                    id,
                    started_at,
                    duration_ms,
                    pages,
                    partial,
                    created,
                    updated,
                    unchanged,
                    flagged,
                    errors,
                },
            )
            .collect())
    }
}
