//! Engine configuration.

use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Provider read-API settings, used only by the reconciliation job.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    /// Page size requested from the provider list endpoint.
    pub page_limit: u32,
}

/// Configuration for the synchronization engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// Replay-protection window for the signature timestamp.
    pub signature_tolerance: Duration,
    /// Webhook processing deadline. Must stay well under the provider's own
    /// retry timeout so a slow failure still gets redelivered.
    pub processing_deadline: Duration,
    /// How long a `processing` ledger row is considered owned before a later
    /// delivery may reclaim it.
    pub processing_lease: Duration,
    /// Deadline for a full reconciliation pass, checked between pages.
    pub reconcile_deadline: Duration,
    pub provider: ProviderConfig,
}

impl SyncConfig {
    /// Load configuration from environment variables.
    ///
    /// `WEBHOOK_SECRET`, `PROVIDER_BASE_URL` and `PROVIDER_API_KEY` are
    /// required; everything else has defaults.
    pub fn from_env() -> SyncResult<Self> {
        let webhook_secret = require_env("WEBHOOK_SECRET")?;
        let base_url = require_env("PROVIDER_BASE_URL")?;
        let api_key = require_env("PROVIDER_API_KEY")?;

        Ok(Self {
            webhook_secret,
            signature_tolerance: Duration::from_secs(env_u64("SIGNATURE_TOLERANCE_SECS", 300)),
            processing_deadline: Duration::from_millis(env_u64("PROCESSING_DEADLINE_MS", 10_000)),
            processing_lease: Duration::from_secs(env_u64("PROCESSING_LEASE_SECS", 300)),
            reconcile_deadline: Duration::from_secs(env_u64("RECONCILE_DEADLINE_SECS", 600)),
            provider: ProviderConfig {
                base_url,
                api_key,
                page_limit: env_u64("PROVIDER_PAGE_LIMIT", 100) as u32,
            },
        })
    }
}

fn require_env(name: &'static str) -> SyncResult<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(SyncError::Config(format!("{} must be set", name))),
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
