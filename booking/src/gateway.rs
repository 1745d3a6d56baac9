//! Payment provider abstraction.
//!
//! The booking core only needs four calls: place a hold, take it, give money
//! back, release a hold. [`MockPaymentGateway`] always succeeds (development);
//! [`ScriptedPaymentGateway`] lets tests queue declines, outages and delays.

use crate::types::{BookingId, Money, PartyId};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Payment gateway result
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Boxed future returned by gateway calls
pub type GatewayFuture<T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send>>;

/// Payment gateway error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Card or account declined
    #[error("declined: {reason}")]
    Declined {
        /// Decline reason
        reason: String,
    },
    /// The hold lapsed at the provider
    #[error("authorization expired")]
    AuthorizationExpired,
    /// Provider rejected the request as malformed
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// Detail
        reason: String,
    },
    /// Provider did not answer in time
    #[error("gateway timeout")]
    Timeout,
    /// Provider is down or returned a server error
    #[error("gateway unavailable: {message}")]
    Unavailable {
        /// Detail
        message: String,
    },
}

/// Context sent with an authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationMetadata {
    /// Booking being paid for
    pub booking_id: BookingId,
    /// Payer
    pub requester: PartyId,
}

/// Successful authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    /// Provider authorization id
    pub authorization_id: String,
    /// Provider-reported expiry, when it tells us
    pub expires_at: Option<DateTime<Utc>>,
}

/// Payment gateway trait
///
/// Abstraction over payment processors (Stripe, Adyen, ...).
pub trait PaymentGateway: Send + Sync {
    /// Place a hold for `amount`
    ///
    /// # Errors
    ///
    /// Returns error if the hold is declined or the provider fails
    fn authorize(&self, amount: Money, metadata: AuthorizationMetadata) -> GatewayFuture<Authorization>;

    /// Take `amount` of an existing hold; returns the capture id
    ///
    /// # Errors
    ///
    /// Returns error if the hold lapsed or the provider fails
    fn capture(&self, authorization_id: &str, amount: Money) -> GatewayFuture<String>;

    /// Return `amount` of a capture; returns the refund id
    ///
    /// `idempotency_key` identifies the request: repeating a call with the same
    /// key returns the original refund instead of issuing another.
    ///
    /// # Errors
    ///
    /// Returns error if the provider rejects the refund
    fn refund(&self, capture_id: &str, amount: Money, idempotency_key: &str) -> GatewayFuture<String>;

    /// Release an uncaptured hold
    ///
    /// # Errors
    ///
    /// Returns error if the provider fails
    fn void(&self, authorization_id: &str) -> GatewayFuture<()>;
}

/// Mock payment gateway (always succeeds for development)
#[derive(Clone, Debug, Default)]
pub struct MockPaymentGateway {
    latency: Duration,
}

impl MockPaymentGateway {
    /// Creates a new mock payment gateway
    #[must_use]
    pub const fn new() -> Self {
        Self {
            latency: Duration::ZERO,
        }
    }

    /// Simulate network latency on every call
    #[must_use]
    pub const fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }

    async fn pause(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn authorize(&self, amount: Money, metadata: AuthorizationMetadata) -> GatewayFuture<Authorization> {
        let latency = self.latency;
        Box::pin(async move {
            Self::pause(latency).await;
            let authorization_id = format!("mock_auth_{}", uuid::Uuid::new_v4());
            tracing::info!(
                booking_id = %metadata.booking_id,
                amount = %amount,
                authorization_id = %authorization_id,
                "Mock authorization placed"
            );
            Ok(Authorization {
                authorization_id,
                expires_at: None,
            })
        })
    }

    fn capture(&self, authorization_id: &str, amount: Money) -> GatewayFuture<String> {
        let latency = self.latency;
        let authorization_id = authorization_id.to_string();
        Box::pin(async move {
            Self::pause(latency).await;
            let capture_id = format!("mock_cap_{}", uuid::Uuid::new_v4());
            tracing::info!(
                authorization_id = %authorization_id,
                amount = %amount,
                capture_id = %capture_id,
                "Mock capture processed"
            );
            Ok(capture_id)
        })
    }

    fn refund(&self, capture_id: &str, amount: Money, idempotency_key: &str) -> GatewayFuture<String> {
        let latency = self.latency;
        let capture_id = capture_id.to_string();
        let idempotency_key = idempotency_key.to_string();
        Box::pin(async move {
            Self::pause(latency).await;
            let refund_id = format!("mock_refund_{}", uuid::Uuid::new_v4());
            tracing::info!(
                capture_id = %capture_id,
                amount = %amount,
                idempotency_key = %idempotency_key,
                refund_id = %refund_id,
                "Mock refund processed"
            );
            Ok(refund_id)
        })
    }

    fn void(&self, authorization_id: &str) -> GatewayFuture<()> {
        let latency = self.latency;
        let authorization_id = authorization_id.to_string();
        Box::pin(async move {
            Self::pause(latency).await;
            tracing::info!(authorization_id = %authorization_id, "Mock authorization voided");
            Ok(())
        })
    }
}

/// Gateway operation, used to script and count calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GatewayOperation {
    /// `authorize`
    Authorize,
    /// `capture`
    Capture,
    /// `refund`
    Refund,
    /// `void`
    Void,
}

#[derive(Debug, Default)]
struct Script {
    failures: HashMap<GatewayOperation, VecDeque<GatewayError>>,
    delays: HashMap<GatewayOperation, Duration>,
    calls: HashMap<GatewayOperation, usize>,
    /// Refund id and amount per idempotency key
    refunds: HashMap<String, (String, Money)>,
}

/// Succeeds like the mock unless told otherwise; counts every call.
#[derive(Debug, Default)]
pub struct ScriptedPaymentGateway {
    script: Arc<Mutex<Script>>,
    expires_at: Option<DateTime<Utc>>,
}

impl ScriptedPaymentGateway {
    /// A gateway with nothing scripted
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `at` as the expiry of every authorization
    #[must_use]
    pub fn with_expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Make the next call to `operation` fail with `error`
    pub fn fail_next(&self, operation: GatewayOperation, error: GatewayError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Make every call to `operation` take `delay`
    pub fn delay(&self, operation: GatewayOperation, delay: Duration) {
        self.lock().delays.insert(operation, delay);
    }

    /// How often `operation` was called
    #[must_use]
    pub fn calls(&self, operation: GatewayOperation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Total returned across distinct refunds, as the provider sees it
    #[must_use]
    pub fn refunded(&self) -> Money {
        self.lock()
            .refunds
            .values()
            .fold(Money::ZERO, |total, (_, amount)| total.saturating_add(*amount))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call and take its scripted delay and failure.
    fn begin(&self, operation: GatewayOperation) -> (Duration, Option<GatewayError>) {
        let mut script = self.lock();
        *script.calls.entry(operation).or_default() += 1;
        let delay = script.delays.get(&operation).copied().unwrap_or_default();
        let failure = script
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        (delay, failure)
    }

    fn call<T, F>(&self, operation: GatewayOperation, ok: F) -> GatewayFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (delay, failure) = self.begin(operation);
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match failure {
                Some(error) => Err(error),
                None => Ok(ok()),
            }
        })
    }
}

impl PaymentGateway for ScriptedPaymentGateway {
    fn authorize(&self, _amount: Money, _metadata: AuthorizationMetadata) -> GatewayFuture<Authorization> {
        let expires_at = self.expires_at;
        self.call(GatewayOperation::Authorize, move || Authorization {
            authorization_id: format!("auth_{}", uuid::Uuid::new_v4().simple()),
            expires_at,
        })
    }

    fn capture(&self, _authorization_id: &str, _amount: Money) -> GatewayFuture<String> {
        self.call(GatewayOperation::Capture, || {
            format!("cap_{}", uuid::Uuid::new_v4().simple())
        })
    }

    fn refund(&self, _capture_id: &str, amount: Money, idempotency_key: &str) -> GatewayFuture<String> {
        let script = Arc::clone(&self.script);
        let key = idempotency_key.to_string();
        self.call(GatewayOperation::Refund, move || {
            let mut script = script.lock().unwrap_or_else(PoisonError::into_inner);
            let (refund_id, _) = script
                .refunds
                .entry(key)
                .or_insert_with(|| (format!("re_{}", uuid::Uuid::new_v4().simple()), amount));
            refund_id.clone()
        })
    }

    fn void(&self, _authorization_id: &str) -> GatewayFuture<()> {
        self.call(GatewayOperation::Void, || ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn metadata() -> AuthorizationMetadata {
        AuthorizationMetadata {
            booking_id: BookingId::new(),
            requester: PartyId::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_gateway_succeeds() {
        let gateway = MockPaymentGateway::new();
        let auth = gateway
            .authorize(Money::from_cents(4250), metadata())
            .await
            .unwrap();
        assert!(auth.authorization_id.starts_with("mock_auth_"));

        let capture_id = gateway
            .capture(&auth.authorization_id, Money::from_cents(4250))
            .await
            .unwrap();
        assert!(capture_id.starts_with("mock_cap_"));

        let refund_id = gateway
            .refund(&capture_id, Money::from_cents(1500), "refund-1")
            .await
            .unwrap();
        assert!(refund_id.starts_with("mock_refund_"));
    }

    #[tokio::test]
    async fn test_scripted_failure_applies_once() {
        let gateway = ScriptedPaymentGateway::new();
        gateway.fail_next(
            GatewayOperation::Authorize,
            GatewayError::Declined {
                reason: "insufficient_funds".to_string(),
            },
        );

        let first = gateway.authorize(Money::from_cents(100), metadata()).await;
        assert!(matches!(first, Err(GatewayError::Declined { .. })));

        let second = gateway.authorize(Money::from_cents(100), metadata()).await;
        assert!(second.is_ok());
        assert_eq!(gateway.calls(GatewayOperation::Authorize), 2);
        assert_eq!(gateway.calls(GatewayOperation::Capture), 0);
    }

    #[tokio::test]
    async fn test_scripted_refund_replays_same_key() {
        let gateway = ScriptedPaymentGateway::new();

        let first = gateway
            .refund("cap_1", Money::from_cents(1500), "refund-1")
            .await
            .unwrap();
        let again = gateway
            .refund("cap_1", Money::from_cents(1500), "refund-1")
            .await
            .unwrap();
        let other = gateway
            .refund("cap_1", Money::from_cents(500), "refund-2")
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(gateway.calls(GatewayOperation::Refund), 3);
        assert_eq!(gateway.refunded(), Money::from_cents(2000));
    }
}
