//! Subscription state machine: per-event-type transition functions.
//!
//! Each handler takes the current (possibly absent) subscription and the
//! event payload and returns the next full subscription value. Transitions
//! are event-driven, not graph-constrained: the provider is the source of
//! truth, so a `canceled` subscription may become `active` again if a newer
//! event says so. The ordering guard in the write path is the only gate.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::event::{
    optional_timestamp, EventKind, EventPayload, Subscription, SubscriptionStatus, VerifiedEvent,
};

/// A state-setting function for one event type.
pub type Handler =
    fn(Option<&Subscription>, Uuid, &VerifiedEvent, &EventPayload) -> SyncResult<Subscription>;

/// Typed mapping from event type to handler, built once at process start and
/// passed explicitly to the event processor.
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Handler>,
}

impl HandlerRegistry {
    /// The standard mapping covering every event type the engine accepts.
    pub fn standard() -> Self {
        let mut handlers: HashMap<EventKind, Handler> = HashMap::new();
        handlers.insert(EventKind::SubscriptionCreated, handle_snapshot);
        handlers.insert(EventKind::SubscriptionUpdated, handle_snapshot);
        handlers.insert(EventKind::SubscriptionDeleted, handle_deleted);
        handlers.insert(EventKind::SubscriptionPaused, handle_paused);
        handlers.insert(EventKind::SubscriptionResumed, handle_resumed);
        handlers.insert(EventKind::TrialWillEnd, handle_trial_will_end);
        Self { handlers }
    }

    pub fn get(&self, kind: EventKind) -> Option<Handler> {
        self.handlers.get(&kind).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Build the next subscription value from the payload, falling back to the
/// stored record for fields the payload omits. Nothing is fabricated: a
/// field absent from both stays unset.
fn next_subscription(
    current: Option<&Subscription>,
    account_id: Uuid,
    event: &VerifiedEvent,
    payload: &EventPayload,
    status: SubscriptionStatus,
) -> SyncResult<Subscription> {
    let plan_tier = payload
        .plan_tier
        .or(current.map(|s| s.plan_tier))
        .ok_or(SyncError::MissingField("plan_tier"))?;

    Ok(Subscription {
        subscription_id: payload.subscription_id.clone(),
        account_id,
        plan_tier,
        status,
        current_period_start: optional_timestamp(payload.current_period_start)?
            .or_else(|| current.and_then(|s| s.current_period_start)),
        current_period_end: optional_timestamp(payload.current_period_end)?
            .or_else(|| current.and_then(|s| s.current_period_end)),
        trial_end: optional_timestamp(payload.trial_end)?
            .or_else(|| current.and_then(|s| s.trial_end)),
        cancel_at_period_end: payload
            .cancel_at_period_end
            .or(current.map(|s| s.cancel_at_period_end))
            .unwrap_or(false),
        amount_cents: payload
            .amount_cents
            .or_else(|| current.and_then(|s| s.amount_cents)),
        currency: payload
            .currency
            .clone()
            .or_else(|| current.and_then(|s| s.currency.clone())),
        billing_interval: payload
            .billing_interval
            .clone()
            .or_else(|| current.and_then(|s| s.billing_interval.clone())),
        source_event_timestamp: event.occurred_at,
    })
}

/// `subscription.created` / `subscription.updated`: take the payload status
/// verbatim. First-seen events may well be "updated" rather than "created",
/// so both share the same snapshot semantics.
fn handle_snapshot(
    current: Option<&Subscription>,
    account_id: Uuid,
    event: &VerifiedEvent,
    payload: &EventPayload,
) -> SyncResult<Subscription> {
    let status = payload
        .status
        .or(current.map(|s| s.status))
        .ok_or(SyncError::MissingField("status"))?;
    next_subscription(current, account_id, event, payload, status)
}

/// `subscription.deleted`: terminal in practice, represented as a status
/// value. The row is kept for audit.
fn handle_deleted(
    current: Option<&Subscription>,
    account_id: Uuid,
    event: &VerifiedEvent,
    payload: &EventPayload,
) -> SyncResult<Subscription> {
    next_subscription(
        current,
        account_id,
        event,
        payload,
        SubscriptionStatus::Canceled,
    )
}

fn handle_paused(
    current: Option<&Subscription>,
    account_id: Uuid,
    event: &VerifiedEvent,
    payload: &EventPayload,
) -> SyncResult<Subscription> {
    next_subscription(
        current,
        account_id,
        event,
        payload,
        SubscriptionStatus::Paused,
    )
}

fn handle_resumed(
    current: Option<&Subscription>,
    account_id: Uuid,
    event: &VerifiedEvent,
    payload: &EventPayload,
) -> SyncResult<Subscription> {
    next_subscription(
        current,
        account_id,
        event,
        payload,
        SubscriptionStatus::Active,
    )
}

/// `subscription.trial_will_end`: an advance notice, not a state change.
/// Refreshes `trial_end`; the status stays whatever is known.
fn handle_trial_will_end(
    current: Option<&Subscription>,
    account_id: Uuid,
    event: &VerifiedEvent,
    payload: &EventPayload,
) -> SyncResult<Subscription> {
    let status = payload
        .status
        .or(current.map(|s| s.status))
        .unwrap_or(SubscriptionStatus::Trialing);
    next_subscription(current, account_id, event, payload, status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PlanTier;
    use time::OffsetDateTime;

    fn event_at(unix: i64, event_type: &str) -> VerifiedEvent {
        VerifiedEvent {
            event_id: format!("ev_{}", unix),
            event_type: event_type.to_string(),
            occurred_at: OffsetDateTime::from_unix_timestamp(unix).unwrap(),
            payload: serde_json::Value::Null,
        }
    }

    fn payload(value: serde_json::Value) -> EventPayload {
        EventPayload::from_value(&value).unwrap()
    }

    fn account() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn standard_registry_covers_all_kinds() {
        let registry = HandlerRegistry::standard();
        for kind in [
            EventKind::SubscriptionCreated,
            EventKind::SubscriptionUpdated,
            EventKind::SubscriptionDeleted,
            EventKind::SubscriptionPaused,
            EventKind::SubscriptionResumed,
            EventKind::TrialWillEnd,
        ] {
            assert!(registry.get(kind).is_some(), "missing handler for {:?}", kind);
        }
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn created_takes_payload_verbatim() {
        let event = event_at(100, "subscription.created");
        let p = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "status": "trialing",
            "plan_tier": "pro",
            "trial_end": 2000,
            "amount_cents": 4900,
            "currency": "usd",
            "billing_interval": "monthly",
        }));

        let sub = handle_snapshot(None, account(), &event, &p).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert_eq!(sub.plan_tier, PlanTier::Pro);
        assert_eq!(sub.trial_end.unwrap().unix_timestamp(), 2000);
        assert_eq!(sub.amount_cents, Some(4900));
        assert_eq!(sub.source_event_timestamp.unix_timestamp(), 100);
    }

    #[test]
    fn absent_timestamps_stay_unset() {
        let event = event_at(100, "subscription.created");
        let p = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "status": "active",
            "plan_tier": "basic",
        }));

        let sub = handle_snapshot(None, account(), &event, &p).unwrap();
        assert!(sub.current_period_start.is_none());
        assert!(sub.current_period_end.is_none());
        assert!(sub.trial_end.is_none());
    }

    #[test]
    fn update_falls_back_to_stored_fields() {
        let event = event_at(100, "subscription.created");
        let p = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "status": "active",
            "plan_tier": "team",
            "current_period_end": 9999,
            "cancel_at_period_end": true,
        }));
        let owner = account();
        let stored = handle_snapshot(None, owner, &event, &p).unwrap();

        // Partial update: only a status change on the wire.
        let event2 = event_at(200, "subscription.updated");
        let p2 = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "status": "past_due",
        }));
        let next = handle_snapshot(Some(&stored), owner, &event2, &p2).unwrap();

        assert_eq!(next.status, SubscriptionStatus::PastDue);
        assert_eq!(next.plan_tier, PlanTier::Team);
        assert_eq!(next.current_period_end.unwrap().unix_timestamp(), 9999);
        assert!(next.cancel_at_period_end);
        assert_eq!(next.source_event_timestamp.unix_timestamp(), 200);
    }

    #[test]
    fn deleted_forces_canceled() {
        let event = event_at(100, "subscription.created");
        let p = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "status": "active",
            "plan_tier": "pro",
        }));
        let owner = account();
        let stored = handle_snapshot(None, owner, &event, &p).unwrap();

        let event2 = event_at(200, "subscription.deleted");
        let p2 = payload(serde_json::json!({ "subscription_id": "sub_1" }));
        let next = handle_deleted(Some(&stored), owner, &event2, &p2).unwrap();
        assert_eq!(next.status, SubscriptionStatus::Canceled);
    }

    #[test]
    fn paused_and_resumed_set_status() {
        let event = event_at(100, "subscription.created");
        let p = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "status": "active",
            "plan_tier": "pro",
        }));
        let owner = account();
        let stored = handle_snapshot(None, owner, &event, &p).unwrap();

        let pause_event = event_at(200, "subscription.paused");
        let p2 = payload(serde_json::json!({ "subscription_id": "sub_1" }));
        let paused = handle_paused(Some(&stored), owner, &pause_event, &p2).unwrap();
        assert_eq!(paused.status, SubscriptionStatus::Paused);

        let resume_event = event_at(300, "subscription.resumed");
        let resumed = handle_resumed(Some(&paused), owner, &resume_event, &p2).unwrap();
        assert_eq!(resumed.status, SubscriptionStatus::Active);
    }

    #[test]
    fn resubscription_after_cancel_is_permitted() {
        let event = event_at(100, "subscription.deleted");
        let p = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "plan_tier": "basic",
        }));
        let owner = account();
        let canceled = handle_deleted(None, owner, &event, &p).unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);

        let event2 = event_at(200, "subscription.updated");
        let p2 = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "status": "active",
        }));
        let next = handle_snapshot(Some(&canceled), owner, &event2, &p2).unwrap();
        assert_eq!(next.status, SubscriptionStatus::Active);
    }

    #[test]
    fn trial_will_end_refreshes_trial_without_status_change() {
        let event = event_at(100, "subscription.created");
        let p = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "status": "trialing",
            "plan_tier": "pro",
        }));
        let owner = account();
        let stored = handle_snapshot(None, owner, &event, &p).unwrap();

        let event2 = event_at(200, "subscription.trial_will_end");
        let p2 = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "trial_end": 5000,
        }));
        let next = handle_trial_will_end(Some(&stored), owner, &event2, &p2).unwrap();
        assert_eq!(next.status, SubscriptionStatus::Trialing);
        assert_eq!(next.trial_end.unwrap().unix_timestamp(), 5000);
    }

    #[test]
    fn snapshot_without_status_anywhere_is_a_data_error() {
        let event = event_at(100, "subscription.updated");
        let p = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "plan_tier": "pro",
        }));
        let err = handle_snapshot(None, account(), &event, &p).unwrap_err();
        assert!(matches!(err, SyncError::MissingField("status")));
    }

    #[test]
    fn first_sight_without_plan_tier_is_a_data_error() {
        let event = event_at(100, "subscription.created");
        let p = payload(serde_json::json!({
            "subscription_id": "sub_1",
            "status": "active",
        }));
        let err = handle_snapshot(None, account(), &event, &p).unwrap_err();
        assert!(matches!(err, SyncError::MissingField("plan_tier")));
    }
}
