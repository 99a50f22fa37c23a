//! Webhook signature verification.
//!
//! Authenticates an inbound event against the shared webhook secret and
//! decodes it into a [`VerifiedEvent`]. Verification operates on the exact
//! raw bytes as received; callers must not parse or re-serialize the body
//! first.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::VerificationError;
use crate::event::VerifiedEvent;

type HmacSha256 = Hmac<Sha256>;

/// Wire envelope of a provider event.
#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    /// Provider-side unix timestamp of when the event occurred.
    created: i64,
    data: serde_json::Value,
}

/// Verifies and decodes inbound provider events.
#[derive(Clone)]
pub struct EventVerifier {
    secret: String,
    tolerance: Duration,
}

impl EventVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Verify the signature header against the raw payload and decode it.
    ///
    /// The header carries `t=<unix>,v1=<hex hmac>` where the MAC is
    /// HMAC-SHA256 over `"{t}.{payload}"`. The timestamp must be within the
    /// configured tolerance window (replay protection) and the comparison is
    /// constant-time.
    pub fn verify(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<VerifiedEvent, VerificationError> {
        let (timestamp, provided) = parse_signature_header(signature_header)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let age = (now - timestamp).abs();
        let tolerance_secs = self.tolerance.as_secs() as i64;
        if age > tolerance_secs {
            return Err(VerificationError::StaleTimestamp {
                age_secs: age,
                tolerance_secs,
            });
        }

        let expected = compute_signature(&self.secret, timestamp, payload)?;
        let matches: bool = expected.as_bytes().ct_eq(provided.as_bytes()).into();
        if !matches {
            tracing::warn!(
                payload_len = payload.len(),
                "Webhook signature mismatch"
            );
            return Err(VerificationError::SignatureMismatch);
        }

        let envelope: EventEnvelope = serde_json::from_slice(payload)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;

        let occurred_at = OffsetDateTime::from_unix_timestamp(envelope.created)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;

        Ok(VerifiedEvent {
            event_id: envelope.id,
            event_type: envelope.event_type,
            occurred_at,
            payload: envelope.data,
        })
    }
}

/// Parse `t=<unix>,v1=<hex>` out of the signature header.
fn parse_signature_header(header: &str) -> Result<(i64, String), VerificationError> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        VerificationError::MalformedPayload("missing timestamp in signature header".to_string())
    })?;
    let v1_signature = v1_signature.ok_or_else(|| {
        VerificationError::MalformedPayload("missing v1 signature in signature header".to_string())
    })?;

    Ok((timestamp, v1_signature))
}

fn compute_signature(
    secret: &str,
    timestamp: i64,
    payload: &[u8],
) -> Result<String, VerificationError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        VerificationError::SignatureMismatch
    })?;
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerificationError;

    const SECRET: &str = "whsec_test123secret456";

    fn verifier() -> EventVerifier {
        EventVerifier::new(SECRET, Duration::from_secs(300))
    }

    fn sample_payload() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "ev_100",
            "type": "subscription.updated",
            "created": OffsetDateTime::now_utc().unix_timestamp(),
            "data": { "subscription_id": "sub_1", "status": "active" }
        }))
        .unwrap()
    }

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let sig = compute_signature(secret, timestamp, payload).unwrap();
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn valid_signature_is_accepted() {
        let payload = sample_payload();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(&payload, SECRET, now);

        let event = verifier().verify(&payload, &header).unwrap();
        assert_eq!(event.event_id, "ev_100");
        assert_eq!(event.event_type, "subscription.updated");
        assert_eq!(event.payload["subscription_id"], "sub_1");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = sample_payload();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(&payload, "wrong_secret", now);

        assert_eq!(
            verifier().verify(&payload, &header),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn modified_payload_is_rejected() {
        let payload = sample_payload();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(&payload, SECRET, now);

        let mut tampered = payload.clone();
        tampered.extend_from_slice(b" ");
        assert_eq!(
            verifier().verify(&tampered, &header),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = sample_payload();
        // 10 minutes ago, beyond the 5 minute tolerance
        let old = OffsetDateTime::now_utc().unix_timestamp() - 600;
        let header = sign(&payload, SECRET, old);

        match verifier().verify(&payload, &header) {
            Err(VerificationError::StaleTimestamp { age_secs, .. }) => {
                assert!(age_secs >= 600);
            }
            other => panic!("expected StaleTimestamp, got {:?}", other),
        }
    }

    #[test]
    fn header_without_signature_is_rejected() {
        let payload = sample_payload();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = format!("t={}", now);

        assert!(matches!(
            verifier().verify(&payload, &header),
            Err(VerificationError::MalformedPayload(_))
        ));
    }

    #[test]
    fn header_without_timestamp_is_rejected() {
        let payload = sample_payload();
        let header = "v1=deadbeef".to_string();

        assert!(matches!(
            verifier().verify(&payload, &header),
            Err(VerificationError::MalformedPayload(_))
        ));
    }

    #[test]
    fn authentic_but_unparseable_body_is_malformed() {
        let payload = b"not json at all".to_vec();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(&payload, SECRET, now);

        assert!(matches!(
            verifier().verify(&payload, &header),
            Err(VerificationError::MalformedPayload(_))
        ));
    }
}
