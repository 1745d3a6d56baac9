//! Payment Coordinator: drives the provider and keeps the local ledger in step.
//!
//! Every provider call is bounded by [`PaymentSettings::provider_timeout`].
//! Ledger writes go through [`PaymentCoordinator::update`], which re-reads and
//! re-applies on a version conflict, so a webhook racing a capture cannot make
//! either one lose its write. A refund is reserved through the same path
//! before the provider sees it, so the version check settles competing
//! refunds while no money has moved.

use crate::booking::Booking;
use crate::error::{BookingError, Result};
use crate::gateway::{AuthorizationMetadata, GatewayError, GatewayFuture, PaymentGateway};
use crate::lifecycle::BookingStatus;
use crate::payment::{CapturePlan, PaymentRecord, RefundPlan, RefundToken, WebhookEvent, WebhookOutcome};
use crate::repository::BookingRepository;
use crate::types::{BookingId, Money};
use skymarket_core::environment::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Attempts made by a read-modify-write before giving up on version conflicts.
pub(crate) const MAX_ATTEMPTS: usize = 3;

/// Provider-facing knobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaymentSettings {
    /// Upper bound on any single provider call
    pub provider_timeout: Duration,
    /// Hold lifetime assumed when the provider does not report one
    pub authorization_ttl: chrono::Duration,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(10),
            authorization_ttl: chrono::Duration::days(7),
        }
    }
}

/// Outcome of applying one provider notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciliation {
    /// Record after the event, `None` if the authorization is unknown
    pub record: Option<PaymentRecord>,
    /// What happened
    pub outcome: WebhookOutcome,
}

/// Authorizes, captures, refunds and voids booking payments.
#[derive(Clone)]
pub struct PaymentCoordinator {
    gateway: Arc<dyn PaymentGateway>,
    repository: Arc<dyn BookingRepository>,
    clock: Arc<dyn Clock>,
    settings: PaymentSettings,
}

impl PaymentCoordinator {
    /// Creates a new `PaymentCoordinator`
    #[must_use]
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        repository: Arc<dyn BookingRepository>,
        clock: Arc<dyn Clock>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            gateway,
            repository,
            clock,
            settings,
        }
    }

    /// Settings in use
    #[must_use]
    pub const fn settings(&self) -> PaymentSettings {
        self.settings
    }

    /// Payment record of a booking.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::NotFound`] if the booking has none.
    pub async fn record(&self, booking_id: BookingId) -> Result<PaymentRecord> {
        self.repository
            .load_payment(booking_id)
            .await?
            .ok_or_else(|| BookingError::payment_not_found(booking_id))
    }

    /// Place a hold for the booking's quoted amount and store the record.
    ///
    /// A decline or outage still stores a failed record so the attempt is on
    /// file.
    ///
    /// # Errors
    ///
    /// - [`BookingError::PaymentDeclined`] if the provider declined
    /// - [`BookingError::PaymentProviderUnavailable`] on timeout or outage
    pub async fn authorize(&self, booking: &Booking) -> Result<PaymentRecord> {
        let metadata = AuthorizationMetadata {
            booking_id: booking.id,
            requester: booking.requester,
        };
        let result = self
            .provider(self.gateway.authorize(booking.quoted_amount, metadata))
            .await;
        let now = self.clock.now();

        match result {
            Ok(authorization) => {
                let expires_at = authorization
                    .expires_at
                    .unwrap_or(now + self.settings.authorization_ttl);
                let record = PaymentRecord::authorized(
                    booking.id,
                    authorization.authorization_id,
                    booking.quoted_amount,
                    now,
                    expires_at,
                );
                let record = self.repository.insert_payment(record).await?;
                tracing::info!(
                    booking_id = %booking.id,
                    amount = %booking.quoted_amount,
                    expires_at = %record.authorization_expires_at,
                    "payment authorized"
                );
                Ok(record)
            },
            Err(error) => {
                let failure = Self::failure(booking.id, "authorize", error, None);
                tracing::warn!(booking_id = %booking.id, error = %failure, "authorization failed");
                let declined = PaymentRecord::declined(booking.id, failure.to_string(), now);
                if let Err(e) = self.repository.insert_payment(declined).await {
                    tracing::error!(booking_id = %booking.id, error = %e, "failed to store declined authorization");
                }
                Err(failure)
            },
        }
    }

    /// Capture the full hold of a `completed` booking.
    ///
    /// # Errors
    ///
    /// - [`BookingError::StateChangedConcurrently`] if the booking left `completed`
    /// - [`BookingError::CaptureWindowExpired`] if the hold lapsed
    /// - [`BookingError::PaymentProviderUnavailable`] on timeout or outage
    pub async fn capture(&self, booking_id: BookingId) -> Result<PaymentRecord> {
        self.capture_while(booking_id, BookingStatus::Completed).await
    }

    /// Capture, provided the booking is still in `expected` right before the
    /// provider call.
    pub(crate) async fn capture_while(
        &self,
        booking_id: BookingId,
        expected: BookingStatus,
    ) -> Result<PaymentRecord> {
        let record = self.record(booking_id).await?;
        let (authorization_id, amount) = match record.plan_capture(self.clock.now())? {
            CapturePlan::AlreadyCaptured => return Ok(record),
            CapturePlan::Capture {
                authorization_id,
                amount,
            } => (authorization_id, amount),
        };

        let booking = self
            .repository
            .load_booking(booking_id)
            .await?
            .ok_or_else(|| BookingError::booking_not_found(booking_id))?;
        if booking.status != expected {
            return Err(BookingError::StateChangedConcurrently {
                booking_id,
                expected,
                actual: booking.status,
            });
        }

        let capture_id = self
            .provider(self.gateway.capture(&authorization_id, amount))
            .await
            .map_err(|e| Self::failure(booking_id, "capture", e, Some(&record)))?;

        let record = self
            .update(booking_id, |record| record.record_capture(capture_id.clone(), amount))
            .await?;
        tracing::info!(booking_id = %booking_id, amount = %amount, "payment captured");
        Ok(record)
    }

    /// Return `amount` (everything refundable if `None`) under `token`.
    ///
    /// Retrying with the same token returns the record unchanged, or resends
    /// a refund whose outcome was never confirmed. A full refund of an
    /// uncaptured hold releases it instead.
    ///
    /// # Errors
    ///
    /// - [`BookingError::RefundExceedsCaptured`] if `amount > captured − refunded`
    /// - [`BookingError::PaymentProviderUnavailable`] on timeout or outage
    pub async fn refund(
        &self,
        booking_id: BookingId,
        amount: Option<Money>,
        token: &RefundToken,
    ) -> Result<PaymentRecord> {
        let record = self.record(booking_id).await?;
        match record.plan_refund(amount, token)? {
            RefundPlan::Replay | RefundPlan::NothingHeld => {
                tracing::debug!(booking_id = %booking_id, token = %token, "refund already settled");
                Ok(record)
            },
            RefundPlan::Void { authorization_id } => {
                self.provider(self.gateway.void(&authorization_id))
                    .await
                    .map_err(|e| Self::failure(booking_id, "void", e, Some(&record)))?;
                let now = self.clock.now();
                let token = token.clone();
                let record = self
                    .update(booking_id, move |record| {
                        record.record_void(Some(token.clone()), now);
                        Ok(())
                    })
                    .await?;
                tracing::info!(booking_id = %booking_id, "authorization voided for refund");
                Ok(record)
            },
            RefundPlan::Refund { .. } => self.reserved_refund(booking_id, amount, token).await,
        }
    }

    /// Reserve, send, then settle one refund.
    async fn reserved_refund(
        &self,
        booking_id: BookingId,
        requested: Option<Money>,
        token: &RefundToken,
    ) -> Result<PaymentRecord> {
        let now = self.clock.now();
        let mut plan = None;
        let record = self
            .update(booking_id, |record| {
                plan = Some(record.reserve_refund(requested, token, now)?);
                Ok(())
            })
            .await?;
        let Some(RefundPlan::Refund { capture_id, amount }) = plan else {
            return Ok(record);
        };
        tracing::debug!(booking_id = %booking_id, token = %token, amount = %amount, "refund reserved");

        let refund_id = match self
            .provider(self.gateway.refund(&capture_id, amount, token.as_str()))
            .await
        {
            Ok(refund_id) => refund_id,
            Err(error) => {
                let refused = matches!(
                    error,
                    GatewayError::Declined { .. }
                        | GatewayError::InvalidRequest { .. }
                        | GatewayError::AuthorizationExpired
                );
                if refused {
                    if let Err(e) = self
                        .update(booking_id, |record| {
                            record.release_refund(token);
                            Ok(())
                        })
                        .await
                    {
                        tracing::error!(booking_id = %booking_id, error = %e, "failed to release refund reservation");
                    }
                } else {
                    // The refund may have gone through; keep the amount held until a retry confirms it.
                    tracing::warn!(booking_id = %booking_id, token = %token, "refund outcome unknown; reservation kept");
                }
                return Err(Self::failure(booking_id, "refund", error, Some(&record)));
            },
        };

        let now = self.clock.now();
        let record = self
            .update(booking_id, |record| {
                record.record_refund(token.clone(), refund_id.clone(), amount, now)
            })
            .await?;
        tracing::info!(
            booking_id = %booking_id,
            amount = %amount,
            refunded = %record.refunded,
            "payment refunded"
        );
        Ok(record)
    }

    /// Release an uncaptured hold. Anything else is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::PaymentProviderUnavailable`] on timeout or outage.
    pub async fn void(&self, booking_id: BookingId) -> Result<PaymentRecord> {
        let record = self.record(booking_id).await?;
        let Some(authorization_id) = record
            .is_live_authorization()
            .then(|| record.authorization_id.clone())
            .flatten()
        else {
            return Ok(record);
        };

        self.provider(self.gateway.void(&authorization_id))
            .await
            .map_err(|e| Self::failure(booking_id, "void", e, Some(&record)))?;
        let now = self.clock.now();
        let record = self
            .update(booking_id, |record| {
                record.record_void(None, now);
                Ok(())
            })
            .await?;
        tracing::info!(booking_id = %booking_id, "authorization voided");
        Ok(record)
    }

    /// Mark a lapsed hold as failed.
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be stored.
    pub async fn mark_expired(&self, booking_id: BookingId) -> Result<PaymentRecord> {
        self.update(booking_id, |record| {
            if record.is_live_authorization() {
                record.record_failure("authorization_expired");
            }
            Ok(())
        })
        .await
    }

    /// Live holds lapsing at or before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns error on storage failure.
    pub async fn expiring(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<Vec<PaymentRecord>> {
        Ok(self.repository.list_expiring_authorizations(cutoff).await?)
    }

    /// Apply one provider notification to the ledger.
    ///
    /// Unknown authorizations are acknowledged as ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be stored after retrying.
    pub async fn apply_webhook(&self, event: &WebhookEvent) -> Result<Reconciliation> {
        for attempt in 1..=MAX_ATTEMPTS {
            let Some(mut record) = self
                .repository
                .find_payment_by_authorization(event.authorization_id.clone())
                .await?
            else {
                tracing::warn!(
                    event_id = %event.event_id,
                    authorization_id = %event.authorization_id,
                    "webhook for unknown authorization"
                );
                return Ok(Reconciliation {
                    record: None,
                    outcome: WebhookOutcome::Ignored {
                        reason: "unknown authorization".to_string(),
                    },
                });
            };

            let outcome = record.apply_webhook(event);
            if matches!(outcome, WebhookOutcome::Duplicate) {
                tracing::debug!(event_id = %event.event_id, "duplicate webhook");
                return Ok(Reconciliation {
                    record: Some(record),
                    outcome,
                });
            }

            match self.repository.save_payment(record).await {
                Ok(record) => {
                    tracing::info!(
                        event_id = %event.event_id,
                        booking_id = %record.booking_id,
                        outcome = ?outcome,
                        status = %record.status,
                        "webhook applied"
                    );
                    return Ok(Reconciliation {
                        record: Some(record),
                        outcome,
                    });
                },
                Err(crate::repository::RepositoryError::ConcurrentModification { .. })
                    if attempt < MAX_ATTEMPTS =>
                {
                    tracing::debug!(event_id = %event.event_id, attempt, "webhook lost a race; retrying");
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(BookingError::ConcurrentModification {
            entity: "payment_record",
            id: event.authorization_id.clone(),
        })
    }

    /// Load, mutate and store a record, retrying on version conflicts.
    async fn update<F>(&self, booking_id: BookingId, mut apply: F) -> Result<PaymentRecord>
    where
        F: FnMut(&mut PaymentRecord) -> Result<()> + Send,
    {
        let mut attempt = 1;
        loop {
            let mut record = self.record(booking_id).await?;
            apply(&mut record)?;
            match self.repository.save_payment(record).await {
                Ok(record) => return Ok(record),
                Err(crate::repository::RepositoryError::ConcurrentModification { .. })
                    if attempt < MAX_ATTEMPTS =>
                {
                    attempt += 1;
                },
                Err(e) => {
                    // Money moved at the provider but the ledger did not follow.
                    tracing::error!(booking_id = %booking_id, error = %e, "payment ledger update failed");
                    return Err(e.into());
                },
            }
        }
    }

    /// Await a provider call, bounded by the configured timeout.
    async fn provider<T>(&self, call: GatewayFuture<T>) -> std::result::Result<T, GatewayError> {
        tokio::time::timeout(self.settings.provider_timeout, call)
            .await
            .unwrap_or(Err(GatewayError::Timeout))
    }

    /// Translate a provider failure into the caller-facing error.
    fn failure(
        booking_id: BookingId,
        operation: &'static str,
        error: GatewayError,
        record: Option<&PaymentRecord>,
    ) -> BookingError {
        match error {
            GatewayError::Declined { reason } => BookingError::PaymentDeclined { booking_id, reason },
            GatewayError::AuthorizationExpired => BookingError::CaptureWindowExpired {
                booking_id,
                expired_at: record.map_or_else(chrono::Utc::now, |r| r.authorization_expires_at),
            },
            GatewayError::InvalidRequest { reason } => {
                tracing::error!(booking_id = %booking_id, operation, reason = %reason, "provider rejected request");
                BookingError::InvalidRequest(reason)
            },
            error @ (GatewayError::Timeout | GatewayError::Unavailable { .. }) => {
                tracing::error!(booking_id = %booking_id, operation, error = %error, "payment provider unavailable");
                BookingError::PaymentProviderUnavailable {
                    operation,
                    reason: error.to_string(),
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::booking::tests::request;
    use crate::booking::{BookingAction, BookingEnvironment, BookingReducer, BookingState};
    use crate::gateway::{GatewayOperation, ScriptedPaymentGateway};
    use crate::geo::ServiceRegion;
    use crate::notifier::RecordingNotifier;
    use crate::payment::{PaymentStatus, WebhookEventKind};
    use crate::pricing::PricingCalculator;
    use crate::repository::InMemoryRepository;
    use crate::types::PartyId;
    use skymarket_core::reducer::Reducer;
    use skymarket_testing::{ManualClock, epoch};

    struct Fixture {
        coordinator: PaymentCoordinator,
        gateway: Arc<ScriptedPaymentGateway>,
        repository: Arc<InMemoryRepository>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let gateway = Arc::new(ScriptedPaymentGateway::new());
        let repository = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(epoch()));
        let coordinator = PaymentCoordinator::new(
            gateway.clone(),
            repository.clone(),
            clock.clone(),
            PaymentSettings::default(),
        );
        Fixture {
            coordinator,
            gateway,
            repository,
            clock,
        }
    }

    async fn stored_booking(fixture: &Fixture) -> Booking {
        let env = BookingEnvironment::new(
            fixture.clock.clone(),
            ServiceRegion::bay_area(),
            PricingCalculator::default(),
            Arc::new(RecordingNotifier::new()),
        );
        let mut state = BookingState::default();
        let _ = BookingReducer::new().reduce(
            &mut state,
            BookingAction::CreateBooking {
                booking_id: BookingId::new(),
                request: request(PartyId::new(), PartyId::new()),
            },
            &env,
        );
        fixture
            .repository
            .insert_booking(state.booking.unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_authorize_uses_default_ttl() {
        let fixture = fixture();
        let booking = stored_booking(&fixture).await;

        let record = fixture.coordinator.authorize(&booking).await.unwrap();
        assert_eq!(record.status, PaymentStatus::Authorized);
        assert_eq!(record.authorized, Money::from_cents(4250));
        assert_eq!(record.authorization_expires_at, epoch() + chrono::Duration::days(7));
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn test_decline_is_stored_as_failed() {
        let fixture = fixture();
        let booking = stored_booking(&fixture).await;
        fixture.gateway.fail_next(
            GatewayOperation::Authorize,
            GatewayError::Declined {
                reason: "insufficient_funds".to_string(),
            },
        );

        let result = fixture.coordinator.authorize(&booking).await;
        assert!(matches!(result, Err(BookingError::PaymentDeclined { ref reason, .. }) if reason == "insufficient_funds"));

        let record = fixture.coordinator.record(booking.id).await.unwrap();
        assert_eq!(record.status, PaymentStatus::Failed);
        assert_eq!(record.authorization_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let fixture = fixture();
        let booking = stored_booking(&fixture).await;
        fixture
            .gateway
            .delay(GatewayOperation::Authorize, Duration::from_secs(30));

        let result = fixture.coordinator.authorize(&booking).await;
        assert!(matches!(
            result,
            Err(BookingError::PaymentProviderUnavailable {
                operation: "authorize",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_capture_requires_completed_booking() {
        let fixture = fixture();
        let booking = stored_booking(&fixture).await;
        fixture.coordinator.authorize(&booking).await.unwrap();

        let result = fixture.coordinator.capture(booking.id).await;
        assert_eq!(
            result,
            Err(BookingError::StateChangedConcurrently {
                booking_id: booking.id,
                expected: BookingStatus::Completed,
                actual: BookingStatus::Pending,
            })
        );
        assert_eq!(fixture.gateway.calls(GatewayOperation::Capture), 0);
    }

    #[tokio::test]
    async fn test_refund_token_is_idempotent() {
        let fixture = fixture();
        let booking = stored_booking(&fixture).await;
        let mut record = fixture.coordinator.authorize(&booking).await.unwrap();
        record
            .record_capture("cap_1".to_string(), Money::from_cents(4250))
            .unwrap();
        fixture.repository.save_payment(record).await.unwrap();

        let token = RefundToken::new("refund-1");
        let first = fixture
            .coordinator
            .refund(booking.id, Some(Money::from_cents(1000)), &token)
            .await
            .unwrap();
        let second = fixture
            .coordinator
            .refund(booking.id, Some(Money::from_cents(1000)), &token)
            .await
            .unwrap();

        assert_eq!(first.refunded, Money::from_cents(1000));
        assert_eq!(second, first);
        assert_eq!(fixture.gateway.calls(GatewayOperation::Refund), 1);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_authorization_is_ignored() {
        let fixture = fixture();
        let event = WebhookEvent {
            event_id: "evt_1".to_string(),
            sequence: 1,
            authorization_id: "auth_missing".to_string(),
            occurred_at: epoch(),
            kind: WebhookEventKind::AuthorizationSucceeded,
        };

        let reconciliation = fixture.coordinator.apply_webhook(&event).await.unwrap();
        assert_eq!(reconciliation.record, None);
        assert!(matches!(reconciliation.outcome, WebhookOutcome::Ignored { .. }));
    }
}
