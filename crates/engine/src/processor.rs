//! Idempotent, order-aware event processing.
//!
//! Exactly-once *effect* on top of at-least-once *delivery*: the ledger's
//! atomic claim decides ownership, the store's guarded upsert decides
//! whether the event is current, and everything else resolves to a stored
//! outcome without re-applying side effects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::event::{EventPayload, Subscription, VerifiedEvent};
use crate::handlers::HandlerRegistry;
use crate::storage::{ApplyOutcome, ClaimDecision, EventLedger, Outcome, SubscriptionStore};

/// How long a losing concurrent claimant polls for the winner's terminal
/// outcome before giving up and asking the provider to redeliver.
const WINNER_POLL_ATTEMPTS: u32 = 10;
const WINNER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Applies verified events to the subscription store through the state
/// machine, consulting the idempotency ledger on every delivery.
pub struct EventProcessor {
    store: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn EventLedger>,
    handlers: Arc<HandlerRegistry>,
    deadline: Duration,
    lease: Duration,
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn EventLedger>,
        handlers: Arc<HandlerRegistry>,
        deadline: Duration,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            handlers,
            deadline,
            lease,
        }
    }

    /// Process one delivery of an event.
    ///
    /// Never panics and never returns a bare error: every path resolves to
    /// an [`Outcome`] the webhook layer can map to a response code. Duplicate
    /// deliveries of the same event id resolve to structurally equal
    /// outcomes.
    pub async fn process(&self, event: &VerifiedEvent) -> Outcome {
        let started = Instant::now();

        let claim = match self
            .ledger
            .claim(
                &event.event_id,
                &event.event_type,
                event.occurred_at,
                self.lease,
            )
            .await
        {
            Ok(claim) => claim,
            Err(e) => {
                tracing::error!(
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to claim event for processing"
                );
                return Outcome::Failed {
                    retryable: true,
                    detail: e.to_string(),
                };
            }
        };

        match claim {
            ClaimDecision::Claimed => {}
            ClaimDecision::Duplicate(outcome) => {
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    outcome = outcome.as_str(),
                    "Duplicate delivery, returning stored outcome"
                );
                return outcome;
            }
            ClaimDecision::Busy => return self.await_winner(event).await,
        }

        tracing::info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Processing event (claimed exclusive processing rights)"
        );

        let outcome = match tokio::time::timeout(self.deadline, self.apply(event)).await {
            Ok(Ok(ApplyOutcome::Applied)) => Outcome::Succeeded,
            Ok(Ok(ApplyOutcome::SkippedStale)) => {
                // Expected under reordering; recorded as success so the
                // provider stops redelivering.
                tracing::info!(
                    event_id = %event.event_id,
                    occurred_at = %event.occurred_at,
                    "Stale event skipped by ordering guard"
                );
                Outcome::Succeeded
            }
            Ok(Err(e)) => {
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Event processing failed"
                );
                Outcome::Failed {
                    retryable: e.is_transient(),
                    detail: e.to_string(),
                }
            }
            Err(_) => {
                // Deadline exceeded. The ledger row keeps its `processing`
                // lease so a later delivery can reclaim it once the lease
                // expires; do not write a terminal outcome here.
                let deadline_ms = self.deadline.as_millis() as u64;
                tracing::warn!(
                    event_id = %event.event_id,
                    deadline_ms,
                    "Processing deadline exceeded, leaving lease for reclaim"
                );
                return Outcome::Failed {
                    retryable: true,
                    detail: SyncError::DeadlineExceeded(deadline_ms).to_string(),
                };
            }
        };

        self.finish(event, outcome, started.elapsed()).await
    }

    /// Steps 3–5: dispatch, ordering guard, guarded persist.
    async fn apply(&self, event: &VerifiedEvent) -> SyncResult<ApplyOutcome> {
        let kind = event
            .kind()
            .ok_or_else(|| SyncError::UnknownEventType(event.event_type.clone()))?;
        let handler = self
            .handlers
            .get(kind)
            .ok_or_else(|| SyncError::UnknownEventType(event.event_type.clone()))?;

        let payload = EventPayload::from_value(&event.payload)?;
        if payload.subscription_id.is_empty() {
            return Err(SyncError::MissingField("subscription_id"));
        }

        let current = self.store.get(&payload.subscription_id).await?;

        // Ordering guard: older-or-equal events are no-ops. The store's
        // upsert re-checks this atomically, so a concurrent racer cannot
        // slip an older write past us.
        if let Some(ref stored) = current {
            if event.occurred_at <= stored.source_event_timestamp {
                return Ok(ApplyOutcome::SkippedStale);
            }
        }

        let account_id = self.resolve_account(current.as_ref(), &payload).await?;
        let candidate = handler(current.as_ref(), account_id, event, &payload)?;
        self.store.apply_if_newer(&candidate).await
    }

    async fn resolve_account(
        &self,
        current: Option<&Subscription>,
        payload: &EventPayload,
    ) -> SyncResult<Uuid> {
        if let Some(sub) = current {
            return Ok(sub.account_id);
        }
        if let Some(account_id) = payload.account_id {
            return Ok(account_id);
        }
        match &payload.customer_id {
            Some(customer) => self
                .store
                .find_account_by_customer(customer)
                .await?
                .ok_or_else(|| SyncError::UnknownAccount(customer.clone())),
            None => Err(SyncError::MissingField("account_id or customer_id")),
        }
    }

    /// A concurrent delivery won the claim race. Poll briefly for its
    /// terminal outcome; if it is still running, report a transient failure
    /// so the provider redelivers. Business logic is never re-applied
    /// speculatively.
    async fn await_winner(&self, event: &VerifiedEvent) -> Outcome {
        for _ in 0..WINNER_POLL_ATTEMPTS {
            tokio::time::sleep(WINNER_POLL_INTERVAL).await;
            match self.ledger.get(&event.event_id).await {
                Ok(Some(record)) => {
                    if let Some(outcome) = record.terminal_outcome() {
                        return outcome;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    return Outcome::Failed {
                        retryable: true,
                        detail: e.to_string(),
                    }
                }
            }
        }

        Outcome::Failed {
            retryable: true,
            detail: SyncError::AlreadyProcessing(event.event_id.clone()).to_string(),
        }
    }

    /// Record the terminal outcome. The audit row matters for idempotency,
    /// so a failed write is retried once before being surfaced as a log-only
    /// error (the computed outcome is still returned to the caller).
    async fn finish(&self, event: &VerifiedEvent, outcome: Outcome, duration: Duration) -> Outcome {
        if let Err(e) = self
            .ledger
            .complete(&event.event_id, &outcome, duration)
            .await
        {
            tracing::warn!(
                event_id = %event.event_id,
                error = %e,
                "First attempt to record event outcome failed, retrying"
            );

            if let Err(retry_err) = self
                .ledger
                .complete(&event.event_id, &outcome, duration)
                .await
            {
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    outcome = outcome.as_str(),
                    first_error = %e,
                    retry_error = %retry_err,
                    "CRITICAL: failed to record event outcome after retry; \
                     row may appear stuck in 'processing' until the lease expires"
                );
            }
        }

        outcome
    }
}
