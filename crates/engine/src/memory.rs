//! In-memory implementations of the storage traits.
//!
//! Mirrors the atomicity of the Postgres backends under a single mutex so
//! the engine's idempotency and ordering properties can be exercised in
//! tests without a database.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::event::{PlanTier, Subscription, SubscriptionStatus};
use crate::reconcile::ReconciliationReport;
use crate::storage::{
    ApplyOutcome, ClaimDecision, EventLedger, EventSummary, LedgerRecord, Outcome, OutcomeLog,
    ReconciliationRun, SubscriptionStore,
};

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<String, Subscription>,
    ledger: HashMap<String, LedgerRecord>,
    runs: Vec<ReconciliationRun>,
    accounts: HashMap<String, Uuid>,
    apply_calls: u64,
}

/// Shared in-memory backend implementing all three storage traits.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account resolvable by its provider customer id.
    pub async fn register_account(&self, external_customer_id: &str, account_id: Uuid) {
        let mut inner = self.inner.lock().await;
        inner
            .accounts
            .insert(external_customer_id.to_string(), account_id);
    }

    /// Number of side-effecting write attempts that reached the store.
    pub async fn apply_count(&self) -> u64 {
        self.inner.lock().await.apply_calls
    }

    /// Read a stored subscription directly (avoids disambiguating the two
    /// trait `get` methods in tests).
    pub async fn subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.inner
            .lock()
            .await
            .subscriptions
            .get(subscription_id)
            .cloned()
    }

    /// Read a ledger record directly.
    pub async fn ledger_record(&self, event_id: &str) -> Option<LedgerRecord> {
        self.inner.lock().await.ledger.get(event_id).cloned()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryBackend {
    async fn get(&self, subscription_id: &str) -> SyncResult<Option<Subscription>> {
        let inner = self.inner.lock().await;
        Ok(inner.subscriptions.get(subscription_id).cloned())
    }

    async fn apply_if_newer(&self, candidate: &Subscription) -> SyncResult<ApplyOutcome> {
        let mut inner = self.inner.lock().await;
        inner.apply_calls += 1;

        let stale = inner
            .subscriptions
            .get(&candidate.subscription_id)
            .map(|stored| candidate.source_event_timestamp <= stored.source_event_timestamp)
            .unwrap_or(false);
        if stale {
            return Ok(ApplyOutcome::SkippedStale);
        }

        inner
            .subscriptions
            .insert(candidate.subscription_id.clone(), candidate.clone());
        Ok(ApplyOutcome::Applied)
    }

    async fn list_ids(&self) -> SyncResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.subscriptions.keys().cloned().collect())
    }

    async fn find_account_by_customer(
        &self,
        external_customer_id: &str,
    ) -> SyncResult<Option<Uuid>> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.get(external_customer_id).copied())
    }

    async fn entitlement(
        &self,
        account_id: Uuid,
    ) -> SyncResult<Option<(SubscriptionStatus, PlanTier)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| s.account_id == account_id)
            .max_by_key(|s| s.source_event_timestamp)
            .map(|s| (s.status, s.plan_tier)))
    }
}

#[async_trait]
impl EventLedger for MemoryBackend {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        occurred_at: OffsetDateTime,
        lease: Duration,
    ) -> SyncResult<ClaimDecision> {
        use std::collections::hash_map::Entry;

        let mut inner = self.inner.lock().await;
        let now = OffsetDateTime::now_utc();

        match inner.ledger.entry(event_id.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(LedgerRecord {
                    event_id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    occurred_at,
                    received_at: now,
                    outcome: "processing".to_string(),
                    retryable: false,
                    error_detail: None,
                    processing_duration_ms: None,
                    processing_started_at: Some(now),
                });
                Ok(ClaimDecision::Claimed)
            }
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                match record.outcome.as_str() {
                    "succeeded" => Ok(ClaimDecision::Duplicate(Outcome::Succeeded)),
                    "failed" if !record.retryable => {
                        Ok(ClaimDecision::Duplicate(Outcome::Failed {
                            retryable: false,
                            detail: record
                                .error_detail
                                .clone()
                                .unwrap_or_else(|| "unknown failure".to_string()),
                        }))
                    }
                    "failed" => {
                        // Retryable failure: redelivery reclaims the row.
                        record.outcome = "processing".to_string();
                        record.retryable = false;
                        record.error_detail = None;
                        record.processing_started_at = Some(now);
                        Ok(ClaimDecision::Claimed)
                    }
                    _ => {
                        let lease_expired = record
                            .processing_started_at
                            .map(|t| (now - t).whole_seconds() >= lease.as_secs() as i64)
                            .unwrap_or(true);
                        if lease_expired {
                            record.processing_started_at = Some(now);
                            Ok(ClaimDecision::Claimed)
                        } else {
                            Ok(ClaimDecision::Busy)
                        }
                    }
                }
            }
        }
    }

    async fn complete(
        &self,
        event_id: &str,
        outcome: &Outcome,
        duration: Duration,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.ledger.get_mut(event_id) {
            record.outcome = outcome.as_str().to_string();
            record.processing_duration_ms = Some(duration.as_millis() as i64);
            match outcome {
                Outcome::Succeeded => {
                    record.retryable = false;
                    record.error_detail = None;
                }
                Outcome::Failed { retryable, detail } => {
                    record.retryable = *retryable;
                    record.error_detail = Some(detail.clone());
                }
            }
        }
        Ok(())
    }

    async fn get(&self, event_id: &str) -> SyncResult<Option<LedgerRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.ledger.get(event_id).cloned())
    }
}

#[async_trait]
impl OutcomeLog for MemoryBackend {
    async fn record_reconciliation(&self, report: &ReconciliationReport) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;
        inner.runs.push(ReconciliationRun {
            id: Uuid::new_v4(),
            started_at: report.started_at,
            duration_ms: report.duration_ms as i64,
            pages: report.pages as i32,
            partial: report.partial,
            created: report.created as i32,
            updated: report.updated as i32,
            unchanged: report.unchanged as i32,
            flagged: report.flagged_local_only.len() as i32,
            errors: report.errors.len() as i32,
        });
        Ok(())
    }

    async fn event_summary(&self, since: OffsetDateTime) -> SyncResult<EventSummary> {
        let inner = self.inner.lock().await;
        let records: Vec<&LedgerRecord> = inner
            .ledger
            .values()
            .filter(|r| r.received_at >= since)
            .collect();

        let durations: Vec<i64> = records
            .iter()
            .filter_map(|r| r.processing_duration_ms)
            .collect();
        let mean_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
        };

        Ok(EventSummary {
            since,
            total: records.len() as i64,
            succeeded: records.iter().filter(|r| r.outcome == "succeeded").count() as i64,
            failed: records.iter().filter(|r| r.outcome == "failed").count() as i64,
            processing: records.iter().filter(|r| r.outcome == "processing").count() as i64,
            mean_duration_ms,
        })
    }

    async fn recent_reconciliations(&self, limit: i64) -> SyncResult<Vec<ReconciliationRun>> {
        let inner = self.inner.lock().await;
        let mut runs = inner.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }
}
