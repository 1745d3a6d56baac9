//! Payment provider webhook signatures.
//!
//! The provider signs `"{timestamp}.{raw body}"` with HMAC-SHA256 and sends
//! `Payment-Signature: t=<unix seconds>,v1=<hex digest>[,v1=<hex digest>…]`.
//! Several `v1` entries may be present while the provider rotates secrets.

use crate::payment::WebhookEvent;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature
pub const SIGNATURE_HEADER: &str = "Payment-Signature";

/// Why a delivery was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    /// Header missing or not `t=…,v1=…`
    #[error("malformed signature header: {0}")]
    MalformedHeader(String),
    /// Timestamp outside the tolerance window
    #[error("signature timestamp {timestamp} is outside the tolerance window")]
    StaleTimestamp {
        /// Unix seconds from the header
        timestamp: i64,
    },
    /// No `v1` digest matches
    #[error("signature mismatch")]
    SignatureMismatch,
    /// Body is not a valid event
    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

/// Verifies and parses provider deliveries.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl WebhookVerifier {
    /// Verifier for `secret` accepting timestamps within five minutes
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            tolerance: Duration::minutes(5),
        }
    }

    /// Override the timestamp tolerance
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Header value for `payload` signed at `timestamp`.
    #[must_use]
    pub fn sign(&self, payload: &[u8], timestamp: DateTime<Utc>) -> String {
        let t = timestamp.timestamp();
        format!("t={t},v1={}", hex::encode(self.digest(t, payload)))
    }

    /// Check the signature of `payload` at `now` and parse it.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError`] if the header is malformed, stale or does not
    /// match, or the body is not an event.
    pub fn verify(&self, header: &str, payload: &[u8], now: DateTime<Utc>) -> Result<WebhookEvent, WebhookError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            let part = part.trim();
            if let Some(rest) = part.strip_prefix("t=") {
                timestamp = Some(
                    rest.parse::<i64>()
                        .map_err(|_| WebhookError::MalformedHeader(format!("bad timestamp {rest:?}")))?,
                );
            } else if let Some(rest) = part.strip_prefix("v1=") {
                signatures.push(rest);
            }
        }
        let timestamp =
            timestamp.ok_or_else(|| WebhookError::MalformedHeader("missing t=".to_string()))?;
        if signatures.is_empty() {
            return Err(WebhookError::MalformedHeader("missing v1=".to_string()));
        }

        if (now.timestamp() - timestamp).abs() > self.tolerance.num_seconds() {
            return Err(WebhookError::StaleTimestamp { timestamp });
        }

        let matched = signatures.iter().any(|signature| {
            hex::decode(signature).is_ok_and(|provided| {
                self.mac(timestamp, payload)
                    .is_some_and(|mac| mac.verify_slice(&provided).is_ok())
            })
        });
        if !matched {
            return Err(WebhookError::SignatureMismatch);
        }

        serde_json::from_slice(payload).map_err(|e| WebhookError::MalformedEvent(e.to_string()))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Option<HmacSha256> {
        // HMAC accepts keys of any length; this only fails for unkeyed MACs.
        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Some(mac)
    }

    fn digest(&self, timestamp: i64, payload: &[u8]) -> Vec<u8> {
        self.mac(timestamp, payload)
            .map(|mac| mac.finalize().into_bytes().to_vec())
            .unwrap_or_default()
    }
}
