//! Domain types: subscriptions, plan tiers, and the provider event contract.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Ordered plan tiers. Ordering matters for entitlement consumers that
/// compare tiers (`tier >= PlanTier::Team`), not for the sync engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Basic,
    Team,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Basic => "basic",
            PlanTier::Team => "team",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(PlanTier::Free),
            "basic" => Some(PlanTier::Basic),
            "team" => Some(PlanTier::Team),
            "pro" => Some(PlanTier::Pro),
            "enterprise" => Some(PlanTier::Enterprise),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of subscription states as reported by the provider.
///
/// Transitions are event-driven, not graph-constrained: the provider is the
/// source of truth, so any state can follow any other as long as the event
/// carrying it is newer than what is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Some(SubscriptionStatus::IncompleteExpired),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local view of one billing relationship.
///
/// `source_event_timestamp` is the provider-side time of the event (or
/// reconciliation snapshot) that last wrote this row. It is the only value
/// used for conflict resolution; the database's `updated_at` is operational
/// metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub account_id: Uuid,
    pub plan_tier: PlanTier,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub billing_interval: Option<String>,
    pub source_event_timestamp: OffsetDateTime,
}

/// Event types the engine knows how to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    SubscriptionPaused,
    SubscriptionResumed,
    TrialWillEnd,
}

impl EventKind {
    /// Parse the wire tag. Unknown tags are a data error handled by the
    /// processor, not a verification failure.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "subscription.created" => Some(EventKind::SubscriptionCreated),
            "subscription.updated" => Some(EventKind::SubscriptionUpdated),
            "subscription.deleted" => Some(EventKind::SubscriptionDeleted),
            "subscription.paused" => Some(EventKind::SubscriptionPaused),
            "subscription.resumed" => Some(EventKind::SubscriptionResumed),
            "subscription.trial_will_end" => Some(EventKind::TrialWillEnd),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            EventKind::SubscriptionCreated => "subscription.created",
            EventKind::SubscriptionUpdated => "subscription.updated",
            EventKind::SubscriptionDeleted => "subscription.deleted",
            EventKind::SubscriptionPaused => "subscription.paused",
            EventKind::SubscriptionResumed => "subscription.resumed",
            EventKind::TrialWillEnd => "subscription.trial_will_end",
        }
    }
}

/// An authenticated, decoded provider event.
///
/// `payload` stays an untyped object here: decoding it into [`EventPayload`]
/// is the processor's job, so payload problems are recorded in the ledger as
/// data errors instead of being rejected at the front door.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEvent {
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: OffsetDateTime,
    pub payload: serde_json::Value,
}

impl VerifiedEvent {
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_tag(&self.event_type)
    }
}

/// Subscription snapshot carried by an event.
///
/// Every field the provider may omit is optional and stays unset when
/// absent. Timestamps are provider-side unix seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    pub subscription_id: String,
    #[serde(default)]
    pub account_id: Option<Uuid>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub status: Option<SubscriptionStatus>,
    #[serde(default)]
    pub plan_tier: Option<PlanTier>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default)]
    pub amount_cents: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub billing_interval: Option<String>,
}

impl EventPayload {
    pub fn from_value(value: &serde_json::Value) -> SyncResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| SyncError::InvalidPayload(e.to_string()))
    }
}

/// Convert optional unix seconds into an optional timestamp.
///
/// An out-of-range value is a data error; absence stays absence.
pub fn optional_timestamp(unix: Option<i64>) -> SyncResult<Option<OffsetDateTime>> {
    match unix {
        None => Ok(None),
        Some(secs) => OffsetDateTime::from_unix_timestamp(secs)
            .map(Some)
            .map_err(|e| SyncError::InvalidPayload(format!("timestamp out of range: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_tiers_are_ordered() {
        assert!(PlanTier::Free < PlanTier::Basic);
        assert!(PlanTier::Basic < PlanTier::Team);
        assert!(PlanTier::Team < PlanTier::Pro);
        assert!(PlanTier::Pro < PlanTier::Enterprise);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Paused,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::parse("suspended"), None);
    }

    #[test]
    fn unknown_event_tag_is_none() {
        assert_eq!(EventKind::from_tag("invoice.paid"), None);
        assert_eq!(
            EventKind::from_tag("subscription.updated"),
            Some(EventKind::SubscriptionUpdated)
        );
    }

    #[test]
    fn payload_tolerates_missing_optional_fields() {
        let value = serde_json::json!({ "subscription_id": "sub_1" });
        let payload = EventPayload::from_value(&value).unwrap();
        assert_eq!(payload.subscription_id, "sub_1");
        assert!(payload.status.is_none());
        assert!(payload.current_period_start.is_none());
        assert!(payload.cancel_at_period_end.is_none());
    }

    #[test]
    fn payload_without_subscription_id_is_invalid() {
        let value = serde_json::json!({ "status": "active" });
        assert!(EventPayload::from_value(&value).is_err());
    }
}
