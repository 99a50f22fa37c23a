// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! billsync Synchronization Engine
//!
//! Keeps the local datastore's view of subscription state consistent with
//! the external billing provider's authoritative state, despite
//! at-least-once, out-of-order, duplicated event delivery and despite the
//! provider being occasionally unreachable.
//!
//! ## Components
//!
//! - **Event Verifier**: authenticates and decodes inbound webhook events
//! - **Idempotency Ledger**: durable outcome per provider event id
//! - **Subscription Store**: ordering-guarded subscription table
//! - **Event Processor**: idempotent, order-aware state machine application
//! - **Reconciliation Job**: full-list drift detection and repair
//! - **Outcome Log**: processing and reconciliation records for operators

pub mod config;
pub mod error;
pub mod event;
pub mod handlers;
pub mod memory;
pub mod postgres;
pub mod processor;
pub mod provider;
pub mod reconcile;
pub mod storage;
pub mod verify;


// Config
pub use config::{ProviderConfig, SyncConfig};

// Error
pub use error::{SyncError, SyncResult, VerificationError};

// Domain types
pub use event::{
    EventKind, EventPayload, PlanTier, Subscription, SubscriptionStatus, VerifiedEvent,
};

// Handlers
pub use handlers::{Handler, HandlerRegistry};

// Processor
pub use processor::EventProcessor;

// Provider
pub use provider::{HttpProviderApi, ProviderApi, ProviderPage, ProviderSubscription};

// Reconciliation
pub use reconcile::{ReconciliationJob, ReconciliationReport, RecordError};

// Storage
pub use storage::{
    ApplyOutcome, ClaimDecision, EventLedger, EventSummary, LedgerRecord, Outcome, OutcomeLog,
    ReconciliationRun, SubscriptionStore,
};

// Verifier
pub use verify::EventVerifier;

use std::sync::Arc;

use sqlx::PgPool;

use postgres::{PgEventLedger, PgOutcomeLog, PgSubscriptionStore};

/// The assembled synchronization engine.
///
/// Binaries construct one of these and talk only to it: the webhook path
/// uses `verifier` + `processor`, the worker uses `reconciler`, and the
/// operational routes read through `store` and `outcomes`.
pub struct SyncEngine {
    pub verifier: EventVerifier,
    pub processor: EventProcessor,
    pub reconciler: ReconciliationJob,
    pub store: Arc<dyn SubscriptionStore>,
    pub outcomes: Arc<dyn OutcomeLog>,
}

impl SyncEngine {
    /// Create the engine from environment variables.
    pub fn from_env(pool: PgPool) -> SyncResult<Self> {
        Ok(Self::new(SyncConfig::from_env()?, pool))
    }

    /// Create the engine with explicit config on Postgres backends.
    pub fn new(config: SyncConfig, pool: PgPool) -> Self {
        let store: Arc<dyn SubscriptionStore> = Arc::new(PgSubscriptionStore::new(pool.clone()));
        let ledger: Arc<dyn EventLedger> = Arc::new(PgEventLedger::new(pool.clone()));
        let outcomes: Arc<dyn OutcomeLog> = Arc::new(PgOutcomeLog::new(pool));
        let provider: Arc<dyn ProviderApi> =
            Arc::new(HttpProviderApi::new(config.provider.clone()));
        Self::with_backends(config, store, ledger, outcomes, provider)
    }

    /// Create the engine over arbitrary backends (tests use the in-memory
    /// implementations from [`memory`]).
    pub fn with_backends(
        config: SyncConfig,
        store: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn EventLedger>,
        outcomes: Arc<dyn OutcomeLog>,
        provider: Arc<dyn ProviderApi>,
    ) -> Self {
        let handlers = Arc::new(HandlerRegistry::standard());
        let verifier =
            EventVerifier::new(config.webhook_secret.clone(), config.signature_tolerance);
        let processor = EventProcessor::new(
            store.clone(),
            ledger,
            handlers,
            config.processing_deadline,
            config.processing_lease,
        );
        let reconciler = ReconciliationJob::new(
            provider,
            store.clone(),
            outcomes.clone(),
            config.reconcile_deadline,
        );

        Self {
            verifier,
            processor,
            reconciler,
            store,
            outcomes,
        }
    }
}
