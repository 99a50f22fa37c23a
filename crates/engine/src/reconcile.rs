//! Periodic reconciliation against the provider's authoritative list.
//!
//! Detects and repairs drift caused by missed or failed event deliveries.
//! All writes go through the same ordering-guarded path the event processor
//! uses, so reconciliation can run concurrently with live processing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::event::{optional_timestamp, Subscription};
use crate::provider::{ProviderApi, ProviderPage, ProviderSubscription};
use crate::storage::{ApplyOutcome, OutcomeLog, SubscriptionStore};

/// A write failure for one provider record. Collected into the report, not
/// propagated: one bad record must not abort the pass.
#[derive(Debug, Clone, Serialize)]
pub struct RecordError {
    pub subscription_id: String,
    pub detail: String,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub started_at: OffsetDateTime,
    pub duration_ms: u64,
    pub pages: u32,
    /// True when the provider list could not be fetched to completion.
    /// A partial pass never flags local-only records, since an incomplete
    /// list cannot prove absence.
    pub partial: bool,
    pub created: u32,
    pub updated: u32,
    pub unchanged: u32,
    /// Present locally, absent from the provider's full list. Flagged for
    /// operators, never deleted.
    pub flagged_local_only: Vec<String>,
    pub errors: Vec<RecordError>,
}

enum RecordAction {
    Created,
    Updated,
    Unchanged,
}

/// Pulls the provider's full subscription list and converges the local
/// store onto it.
pub struct ReconciliationJob {
    provider: Arc<dyn ProviderApi>,
    store: Arc<dyn SubscriptionStore>,
    outcomes: Arc<dyn OutcomeLog>,
    deadline: Duration,
}

impl ReconciliationJob {
    pub fn new(
        provider: Arc<dyn ProviderApi>,
        store: Arc<dyn SubscriptionStore>,
        outcomes: Arc<dyn OutcomeLog>,
        deadline: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            outcomes,
            deadline,
        }
    }

    /// Run one pass. Safe to invoke concurrently with live event
    /// processing; a failed pass is retried on the next scheduled tick,
    /// never looped immediately.
    pub async fn reconcile(&self) -> ReconciliationReport {
        let started_at = OffsetDateTime::now_utc();
        let started = Instant::now();
        let mut report = ReconciliationReport {
            started_at,
            duration_ms: 0,
            pages: 0,
            partial: false,
            created: 0,
            updated: 0,
            unchanged: 0,
            flagged_local_only: Vec::new(),
            errors: Vec::new(),
        };

        // Follow pagination to completion, checking the pass deadline
        // between pages so cancellation is clean.
        let mut records: Vec<ProviderSubscription> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            if started.elapsed() > self.deadline {
                tracing::warn!(
                    pages = report.pages,
                    "Reconciliation deadline reached mid-fetch, completing partially"
                );
                report.partial = true;
                break;
            }

            match self.fetch_page(cursor.as_deref()).await {
                Ok(page) => {
                    report.pages += 1;
                    records.extend(page.records);
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                Err(e) => {
                    tracing::error!(
                        pages = report.pages,
                        error = %e,
                        "Provider page fetch failed, completing partially"
                    );
                    report.partial = true;
                    break;
                }
            }
        }

        let mut provider_ids: HashSet<String> = HashSet::with_capacity(records.len());
        for record in &records {
            provider_ids.insert(record.id.clone());
            match self.sync_record(record).await {
                Ok(RecordAction::Created) => report.created += 1,
                Ok(RecordAction::Updated) => report.updated += 1,
                Ok(RecordAction::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %record.id,
                        error = %e,
                        "Failed to reconcile provider record"
                    );
                    report.errors.push(RecordError {
                        subscription_id: record.id.clone(),
                        detail: e.to_string(),
                    });
                }
            }
        }

        if !report.partial {
            match self.store.list_ids().await {
                Ok(local_ids) => {
                    report.flagged_local_only = local_ids
                        .into_iter()
                        .filter(|id| !provider_ids.contains(id))
                        .collect();
                }
                Err(e) => {
                    report.errors.push(RecordError {
                        subscription_id: "*".to_string(),
                        detail: format!("listing local subscriptions failed: {}", e),
                    });
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;

        if let Err(e) = self.outcomes.record_reconciliation(&report).await {
            tracing::error!(error = %e, "Failed to record reconciliation report");
        }

        tracing::info!(
            pages = report.pages,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            flagged = report.flagged_local_only.len(),
            errors = report.errors.len(),
            partial = report.partial,
            duration_ms = report.duration_ms,
            "Reconciliation pass complete"
        );

        report
    }

    /// Fetch one page, backing off on rate-limit signals only. Other
    /// failures go straight to the caller (partial completion).
    async fn fetch_page(&self, cursor: Option<&str>) -> SyncResult<ProviderPage> {
        let strategy = ExponentialBackoff::from_millis(500).map(jitter).take(3);
        RetryIf::spawn(
            strategy,
            || self.provider.list_subscriptions(cursor),
            |e: &SyncError| matches!(e, SyncError::RateLimited { .. }),
        )
        .await
    }

    async fn sync_record(&self, record: &ProviderSubscription) -> SyncResult<RecordAction> {
        let current = self.store.get(&record.id).await?;
        let account_id = self.resolve_account(current.as_ref(), record).await?;
        let candidate = candidate_from_provider(record, current.as_ref(), account_id)?;

        match current {
            None => match self.store.apply_if_newer(&candidate).await? {
                ApplyOutcome::Applied => Ok(RecordAction::Created),
                // A live event created the row between get and apply.
                ApplyOutcome::SkippedStale => Ok(RecordAction::Unchanged),
            },
            Some(stored) => {
                if !fields_differ(&stored, &candidate) {
                    return Ok(RecordAction::Unchanged);
                }
                if candidate.source_event_timestamp <= stored.source_event_timestamp {
                    // Local state is at least as new; the event stream is
                    // ahead of the eventually-consistent list API.
                    tracing::debug!(
                        subscription_id = %record.id,
                        "Divergent but not newer, leaving local state"
                    );
                    return Ok(RecordAction::Unchanged);
                }
                match self.store.apply_if_newer(&candidate).await? {
                    ApplyOutcome::Applied => Ok(RecordAction::Updated),
                    ApplyOutcome::SkippedStale => Ok(RecordAction::Unchanged),
                }
            }
        }
    }

    async fn resolve_account(
        &self,
        current: Option<&Subscription>,
        record: &ProviderSubscription,
    ) -> SyncResult<Uuid> {
        if let Some(sub) = current {
            return Ok(sub.account_id);
        }
        if let Some(account_id) = record.account_id {
            return Ok(account_id);
        }
        match &record.customer_id {
            Some(customer) => self
                .store
                .find_account_by_customer(customer)
                .await?
                .ok_or_else(|| SyncError::UnknownAccount(customer.clone())),
            None => Err(SyncError::MissingField("account_id or customer_id")),
        }
    }
}

/// Map a provider list record onto the local model, as if a synthetic event
/// with the provider's last-modified time had been processed.
fn candidate_from_provider(
    record: &ProviderSubscription,
    current: Option<&Subscription>,
    account_id: Uuid,
) -> SyncResult<Subscription> {
    let plan_tier = record
        .plan_tier
        .or(current.map(|s| s.plan_tier))
        .ok_or(SyncError::MissingField("plan_tier"))?;

    let source_event_timestamp = OffsetDateTime::from_unix_timestamp(record.updated_at)
        .map_err(|e| SyncError::InvalidPayload(format!("updated_at out of range: {}", e)))?;

    Ok(Subscription {
        subscription_id: record.id.clone(),
        account_id,
        plan_tier,
        status: record.status,
        current_period_start: optional_timestamp(record.current_period_start)?,
        current_period_end: optional_timestamp(record.current_period_end)?,
        trial_end: optional_timestamp(record.trial_end)?,
        cancel_at_period_end: record.cancel_at_period_end.unwrap_or(false),
        amount_cents: record.amount_cents,
        currency: record.currency.clone(),
        billing_interval: record.billing_interval.clone(),
        source_event_timestamp,
    })
}

/// Whether any material field diverges. The ordering timestamp itself is
/// not material: two records describing the same state need no write.
fn fields_differ(stored: &Subscription, candidate: &Subscription) -> bool {
    stored.status != candidate.status
        || stored.plan_tier != candidate.plan_tier
        || stored.current_period_start != candidate.current_period_start
        || stored.current_period_end != candidate.current_period_end
        || stored.trial_end != candidate.trial_end
        || stored.cancel_at_period_end != candidate.cancel_at_period_end
        || stored.amount_cents != candidate.amount_cents
        || stored.currency != candidate.currency
        || stored.billing_interval != candidate.billing_interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{PlanTier, SubscriptionStatus};

    fn record(id: &str, status: SubscriptionStatus, updated_at: i64) -> ProviderSubscription {
        ProviderSubscription {
            id: id.to_string(),
            account_id: Some(Uuid::new_v4()),
            customer_id: None,
            status,
            plan_tier: Some(PlanTier::Pro),
            current_period_start: None,
            current_period_end: None,
            trial_end: None,
            cancel_at_period_end: None,
            amount_cents: Some(4900),
            currency: Some("usd".to_string()),
            billing_interval: Some("monthly".to_string()),
            updated_at,
        }
    }

    #[test]
    fn candidate_uses_provider_modified_time_for_ordering() {
        let rec = record("sub_1", SubscriptionStatus::Active, 1234);
        let candidate = candidate_from_provider(&rec, None, Uuid::new_v4()).unwrap();
        assert_eq!(candidate.source_event_timestamp.unix_timestamp(), 1234);
        assert!(candidate.current_period_start.is_none());
    }

    #[test]
    fn identical_material_fields_do_not_differ() {
        let rec = record("sub_1", SubscriptionStatus::Active, 1000);
        let account = Uuid::new_v4();
        let stored = candidate_from_provider(&rec, None, account).unwrap();

        // Same state reported later: no material difference.
        let newer = record("sub_1", SubscriptionStatus::Active, 2000);
        let candidate = candidate_from_provider(&newer, Some(&stored), account).unwrap();
        assert!(!fields_differ(&stored, &candidate));
    }

    #[test]
    fn status_change_differs() {
        let rec = record("sub_1", SubscriptionStatus::Active, 1000);
        let account = Uuid::new_v4();
        let stored = candidate_from_provider(&rec, None, account).unwrap();

        let changed = record("sub_1", SubscriptionStatus::PastDue, 2000);
        let candidate = candidate_from_provider(&changed, Some(&stored), account).unwrap();
        assert!(fields_differ(&stored, &candidate));
    }

    #[test]
    fn missing_plan_tier_falls_back_to_stored() {
        let rec = record("sub_1", SubscriptionStatus::Active, 1000);
        let account = Uuid::new_v4();
        let stored = candidate_from_provider(&rec, None, account).unwrap();

        let mut partial = record("sub_1", SubscriptionStatus::Active, 2000);
        partial.plan_tier = None;
        let candidate = candidate_from_provider(&partial, Some(&stored), account).unwrap();
        assert_eq!(candidate.plan_tier, PlanTier::Pro);

        assert!(matches!(
            candidate_from_provider(&partial, None, account),
            Err(SyncError::MissingField("plan_tier"))
        ));
    }
}
