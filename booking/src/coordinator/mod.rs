//! Booking service: the inbound API of the lifecycle manager.
//!
//! Each operation follows the same shape:
//!
//! 1. Load the entity and run the command through its reducer on a copy.
//!    A rejection becomes the returned error and nothing is written.
//! 2. Call the payment provider if the command moves money.
//! 3. Store the new state under its expected version.
//! 4. Run the reducer's effects (notifications) once the state is stored.
//!
//! Money moves before the booking commits, and every provider call is keyed
//! so that a retried request replays rather than repeats it.

mod payments;

pub use payments::{PaymentCoordinator, PaymentSettings, Reconciliation};

use crate::booking::{
    Booking, BookingAction, BookingEnvironment, BookingReducer, BookingRequest, BookingState,
    CancellationReason,
};
use crate::dispute::{
    Dispute, DisputeAction, DisputeEnvironment, DisputeReason, DisputeReducer, DisputeState,
    Resolution,
};
use crate::error::{BookingError, Result};
use crate::gateway::PaymentGateway;
use crate::lifecycle::{self, BookingStatus, EdgeKind};
use crate::payment::{
    PaymentRecord, PaymentStatus, RefundPlan, RefundToken, WebhookEvent, WebhookEventKind, WebhookOutcome,
};
use crate::repository::BookingRepository;
use crate::types::{Actor, BookingId, DisputeId, Money};
use payments::MAX_ATTEMPTS;
use serde::Serialize;
use skymarket_core::{SmallVec, effect::Effect, reducer::Reducer};
use std::sync::Arc;

type Effects<A> = SmallVec<[Effect<A>; 4]>;

/// Result of one authorization sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Bookings cancelled because their hold lapsed before work began
    pub cancelled: Vec<BookingId>,
    /// Bookings past `accepted` whose hold lapsed; need a new authorization
    pub needs_reauthorization: Vec<BookingId>,
    /// Bookings the sweep could not process (see logs)
    pub failed: Vec<BookingId>,
}

/// A booking after a command, with the effects still to run.
struct Applied {
    booking: Booking,
    changed: bool,
    effects: Effects<BookingAction>,
}

/// Booking lifecycle manager.
///
/// Stateless apart from its collaborators; every operation reads what it needs
/// from the repository.
#[derive(Clone)]
pub struct BookingService {
    repository: Arc<dyn BookingRepository>,
    payments: PaymentCoordinator,
    env: BookingEnvironment,
    dispute_env: DisputeEnvironment,
    reducer: BookingReducer,
    disputes: DisputeReducer,
}

impl BookingService {
    /// Creates a new `BookingService`
    #[must_use]
    pub fn new(
        repository: Arc<dyn BookingRepository>,
        gateway: Arc<dyn PaymentGateway>,
        env: BookingEnvironment,
        dispute_window: chrono::Duration,
        settings: PaymentSettings,
    ) -> Self {
        let payments = PaymentCoordinator::new(
            gateway,
            Arc::clone(&repository),
            Arc::clone(&env.clock),
            settings,
        );
        let dispute_env = DisputeEnvironment::new(
            Arc::clone(&env.clock),
            dispute_window,
            Arc::clone(&env.notifier),
        );
        Self {
            repository,
            payments,
            env,
            dispute_env,
            reducer: BookingReducer::new(),
            disputes: DisputeReducer::new(),
        }
    }

    /// The payment coordinator this service drives
    #[must_use]
    pub const fn payments(&self) -> &PaymentCoordinator {
        &self.payments
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Load a booking.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::NotFound`] if it does not exist.
    pub async fn booking(&self, booking_id: BookingId) -> Result<Booking> {
        self.repository
            .load_booking(booking_id)
            .await?
            .ok_or_else(|| BookingError::booking_not_found(booking_id))
    }

    /// Load a booking's payment record.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::NotFound`] if it does not exist.
    pub async fn payment(&self, booking_id: BookingId) -> Result<PaymentRecord> {
        self.payments.record(booking_id).await
    }

    /// Load a dispute.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::NotFound`] if it does not exist.
    pub async fn dispute(&self, dispute_id: DisputeId) -> Result<Dispute> {
        self.repository
            .load_dispute(dispute_id)
            .await?
            .ok_or_else(|| BookingError::dispute_not_found(dispute_id))
    }

    // ========================================================================
    // Booking lifecycle
    // ========================================================================

    /// Create a `pending` booking and authorize its quoted amount.
    ///
    /// If the authorization fails the booking is kept, cancelled by the system
    /// with reason `payment_failed`, and the payment error is returned.
    ///
    /// # Errors
    ///
    /// - [`BookingError::InvalidLocation`] / [`BookingError::InvalidQuote`] for a bad request
    /// - [`BookingError::PaymentDeclined`] / [`BookingError::PaymentProviderUnavailable`]
    ///   if the hold could not be placed
    pub async fn create_booking(&self, request: BookingRequest) -> Result<Booking> {
        let booking_id = BookingId::new();
        let mut state = BookingState::default();
        let effects = self.decide(
            &mut state,
            BookingAction::CreateBooking {
                booking_id,
                request,
            },
        )?;
        let booking = state
            .booking
            .ok_or_else(|| BookingError::booking_not_found(booking_id))?;
        let booking = self.repository.insert_booking(booking).await?;
        run_effects(effects).await;

        match self.payments.authorize(&booking).await {
            Ok(record) => {
                let Some(authorization_id) = record.authorization_id else {
                    return Ok(booking);
                };
                let applied = self
                    .apply(
                        booking,
                        BookingAction::PaymentReferenceRecorded { authorization_id },
                    )
                    .await?;
                Ok(applied.booking)
            },
            Err(error) => {
                let cancelled = self
                    .apply(
                        booking,
                        BookingAction::TransitionBooking {
                            target: BookingStatus::Cancelled,
                            actor: Actor::System,
                            reason: Some(CancellationReason::PaymentFailed),
                        },
                    )
                    .await;
                match cancelled {
                    Ok(applied) => run_effects(applied.effects).await,
                    Err(e) => {
                        tracing::error!(booking_id = %booking_id, error = %e, "failed to cancel unpaid booking");
                    },
                }
                Err(error)
            },
        }
    }

    /// Move a booking along a lifecycle edge on behalf of `actor`.
    ///
    /// Entering `completed` captures the hold; entering `cancelled` releases
    /// it. Requesting the current status changes nothing, but finishes either
    /// payment step if it never happened.
    ///
    /// # Errors
    ///
    /// - [`BookingError::IllegalTransition`] for edges not in the table
    /// - [`BookingError::Unauthorized`] if `actor` may not drive the edge
    /// - [`BookingError::ConcurrentModification`] if another write won
    /// - capture/void failures; the booking keeps its new status
    pub async fn transition(
        &self,
        booking_id: BookingId,
        target: BookingStatus,
        actor: Actor,
    ) -> Result<Booking> {
        let booking = self.booking(booking_id).await?;
        let applied = self
            .apply(
                booking,
                BookingAction::TransitionBooking {
                    target,
                    actor,
                    reason: None,
                },
            )
            .await?;

        if applied.changed {
            run_effects(applied.effects).await;
        } else {
            tracing::debug!(booking_id = %booking_id, status = %target, "transition is a no-op");
        }
        self.settle_payment(&applied.booking).await?;
        Ok(applied.booking)
    }

    /// Refund a `completed` or `cancelled` booking and move it to `refunded`.
    ///
    /// Bookings already refunded or resolved take further refunds without a
    /// status change. `token` makes the request idempotent.
    ///
    /// # Errors
    ///
    /// - [`BookingError::Unauthorized`] unless `actor` is the provider or an admin
    /// - [`BookingError::IllegalTransition`] before completion or while disputed
    /// - [`BookingError::RefundExceedsCaptured`] if `amount > captured − refunded`
    pub async fn request_refund(
        &self,
        booking_id: BookingId,
        amount: Option<Money>,
        token: RefundToken,
        actor: Actor,
    ) -> Result<PaymentRecord> {
        let booking = self.booking(booking_id).await?;
        if !booking.role_of(actor).is_some_and(lifecycle::may_refund) {
            return Err(BookingError::Unauthorized {
                actor,
                operation: format!("refund booking {booking_id}"),
            });
        }

        let moves_booking = booking.status.edge_kind(BookingStatus::Refunded) == Some(EdgeKind::Refund);
        let settled = matches!(
            booking.status,
            BookingStatus::Refunded | BookingStatus::ResolvedCaptured | BookingStatus::ResolvedRefunded
        );
        if !moves_booking && !settled {
            return Err(BookingError::IllegalTransition {
                from: booking.status,
                to: BookingStatus::Refunded,
            });
        }
        if moves_booking {
            let mut probe = BookingState::from_booking(booking.clone());
            self.decide(&mut probe, BookingAction::RecordRefund { actor })?;
        }

        let record = self.payments.refund(booking_id, amount, &token).await?;

        if moves_booking {
            // Re-read: the refund call may have taken a while.
            let current = self.booking(booking_id).await?;
            let applied = self.apply(current, BookingAction::RecordRefund { actor }).await?;
            run_effects(applied.effects).await;
        }
        Ok(record)
    }

    // ========================================================================
    // Disputes
    // ========================================================================

    /// Open a dispute on a `completed` booking and move it to `disputed`.
    ///
    /// # Errors
    ///
    /// - [`BookingError::Unauthorized`] unless `initiator` is the requester
    /// - [`BookingError::IllegalTransition`] unless the booking is `completed`
    /// - [`BookingError::DisputeWindowExpired`] past the configured window
    pub async fn open_dispute(
        &self,
        booking_id: BookingId,
        initiator: Actor,
        reason: DisputeReason,
        description: String,
    ) -> Result<Dispute> {
        let booking = self.booking(booking_id).await?;
        let dispute_id = DisputeId::new();

        let mut state = DisputeState::default();
        let dispute_effects = self.decide_dispute(
            &mut state,
            DisputeAction::OpenDispute {
                dispute_id,
                booking: Box::new(booking.clone()),
                initiator,
                reason,
                description,
            },
        )?;
        let dispute = state
            .dispute
            .ok_or_else(|| BookingError::dispute_not_found(dispute_id))?;

        // The booking's version check decides which of two racing opens wins.
        let applied = self
            .apply(
                booking,
                BookingAction::MarkDisputed {
                    dispute_id,
                    actor: initiator,
                },
            )
            .await?;
        let dispute = self.repository.insert_dispute(dispute).await?;

        run_effects(applied.effects).await;
        run_effects(dispute_effects).await;
        Ok(dispute)
    }

    /// Append a message to a dispute's log.
    ///
    /// # Errors
    ///
    /// - [`BookingError::DisputeClosed`] once resolved
    /// - [`BookingError::Unauthorized`] for anyone but the parties or an admin
    pub async fn respond(&self, dispute_id: DisputeId, responder: Actor, message: String) -> Result<Dispute> {
        let mut state = DisputeState::from_dispute(self.dispute(dispute_id).await?);
        let effects = self.decide_dispute(&mut state, DisputeAction::Respond { responder, message })?;
        let dispute = state
            .dispute
            .ok_or_else(|| BookingError::dispute_not_found(dispute_id))?;
        let dispute = self.repository.save_dispute(dispute).await?;
        run_effects(effects).await;
        Ok(dispute)
    }

    /// Close a dispute. Admin only.
    ///
    /// `capture_confirmed` keeps the capture (taking it first if it never
    /// happened) and moves the booking to `resolved_captured`. `refunded`
    /// returns everything still refundable, `partial_refund` returns
    /// `refund_amount`; both move the booking to `resolved_refunded`.
    ///
    /// The decision is stored before any money moves, so of two racing
    /// resolutions only one reaches the provider. If the payment step then
    /// fails, the same arbitrator repeating the same decision finishes it.
    ///
    /// # Errors
    ///
    /// - [`BookingError::Unauthorized`] unless `actor` is an admin
    /// - [`BookingError::DisputeClosed`] if already resolved
    /// - [`BookingError::InvalidRequest`] if `refund_amount` does not fit `resolution`
    /// - [`BookingError::RefundExceedsCaptured`] for an oversized partial refund
    /// - [`BookingError::ConcurrentModification`] if another resolution won
    pub async fn resolve(
        &self,
        dispute_id: DisputeId,
        resolution: Resolution,
        refund_amount: Option<Money>,
        actor: Actor,
    ) -> Result<Dispute> {
        let dispute = self.dispute(dispute_id).await?;
        let booking = self.booking(dispute.booking_id).await?;
        let booking_id = booking.id;
        let token = RefundToken::for_dispute(dispute_id);

        let amount = match (resolution, refund_amount) {
            (Resolution::CaptureConfirmed | Resolution::Refunded, None) => None,
            (Resolution::PartialRefund, Some(amount)) => Some(amount),
            (Resolution::PartialRefund, None) => {
                return Err(BookingError::InvalidRequest(
                    "partial_refund requires a refund amount".to_string(),
                ));
            },
            (Resolution::CaptureConfirmed | Resolution::Refunded, Some(_)) => {
                return Err(BookingError::InvalidRequest(format!(
                    "{} takes no refund amount",
                    resolution.as_str()
                )));
            },
        };

        let resolve_booking = BookingAction::ResolveDispute {
            dispute_id,
            actor,
            outcome: resolution.outcome(),
        };
        let unfinished = booking.status == BookingStatus::Disputed
            && dispute.decision.as_ref().is_some_and(|decision| {
                decision.resolution == resolution
                    && decision.resolved_by == actor
                    && amount.is_none_or(|amount| amount == decision.refunded)
            });

        let dispute = if unfinished {
            tracing::info!(dispute_id = %dispute_id, "finishing a stored resolution");
            dispute
        } else {
            let mut dispute_probe = DisputeState::from_dispute(dispute.clone());
            self.decide_dispute(
                &mut dispute_probe,
                DisputeAction::Resolve {
                    actor,
                    resolution,
                    refunded: Money::ZERO,
                },
            )?;
            let mut booking_probe = BookingState::from_booking(booking);
            self.decide(&mut booking_probe, resolve_booking.clone())?;

            let refunded = self
                .dispute_refund(booking_id, resolution, amount, &token)
                .await?;
            let mut state = DisputeState::from_dispute(dispute);
            let dispute_effects = self.decide_dispute(
                &mut state,
                DisputeAction::Resolve {
                    actor,
                    resolution,
                    refunded,
                },
            )?;
            let dispute = state
                .dispute
                .ok_or_else(|| BookingError::dispute_not_found(dispute_id))?;
            // The dispute's version check decides which of two racing resolutions wins.
            let dispute = self.repository.save_dispute(dispute).await?;
            run_effects(dispute_effects).await;
            dispute
        };

        match resolution {
            Resolution::CaptureConfirmed => {
                if self.payments.record(booking_id).await?.is_live_authorization() {
                    self.payments
                        .capture_while(booking_id, BookingStatus::Disputed)
                        .await?;
                }
            },
            Resolution::Refunded | Resolution::PartialRefund => {
                let refunded = dispute
                    .decision
                    .as_ref()
                    .map_or(Money::ZERO, |decision| decision.refunded);
                self.payments
                    .refund(booking_id, (!refunded.is_zero()).then_some(refunded), &token)
                    .await?;
            },
        }

        let current = self.booking(booking_id).await?;
        let applied = self.apply(current, resolve_booking).await?;
        run_effects(applied.effects).await;
        Ok(dispute)
    }

    /// What a refund resolution will return, decided before the refund is sent.
    async fn dispute_refund(
        &self,
        booking_id: BookingId,
        resolution: Resolution,
        amount: Option<Money>,
        token: &RefundToken,
    ) -> Result<Money> {
        if resolution == Resolution::CaptureConfirmed {
            return Ok(Money::ZERO);
        }
        let record = self.payments.record(booking_id).await?;
        Ok(match record.plan_refund(amount, token)? {
            RefundPlan::Refund { amount, .. } => amount,
            // Released hold: the whole authorization goes back.
            RefundPlan::Void { .. } => record.authorized,
            RefundPlan::Replay | RefundPlan::NothingHeld => Money::ZERO,
        })
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Apply a verified provider notification.
    ///
    /// An authorization that fails or lapses cancels a booking that has not
    /// completed yet.
    ///
    /// # Errors
    ///
    /// Returns error only if storage fails; bad events are acknowledged.
    pub async fn apply_webhook(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let reconciliation = self.payments.apply_webhook(event).await?;

        if let (Some(record), WebhookOutcome::Applied { changed: true }) =
            (&reconciliation.record, &reconciliation.outcome)
        {
            if record.status == PaymentStatus::Failed {
                let reason = match event.kind {
                    WebhookEventKind::AuthorizationExpired => CancellationReason::AuthorizationExpired,
                    _ => CancellationReason::PaymentFailed,
                };
                self.cancel_unpaid(
                    record.booking_id,
                    reason,
                    &[BookingStatus::Pending, BookingStatus::Accepted, BookingStatus::InProgress],
                )
                .await?;
            }
        }
        Ok(reconciliation.outcome)
    }

    /// Find lapsed holds. Bookings that have not started are cancelled with
    /// reason `authorization_expired`; the rest are reported for manual
    /// re-authorization.
    ///
    /// # Errors
    ///
    /// Returns error if the expiring holds cannot be listed. Per-booking
    /// failures are logged and reported in [`SweepReport::failed`].
    pub async fn sweep_expired_authorizations(&self) -> Result<SweepReport> {
        let now = self.env.clock.now();
        let mut report = SweepReport::default();

        for record in self.payments.expiring(now).await? {
            let booking_id = record.booking_id;
            match self.expire(booking_id).await {
                Ok(true) => report.cancelled.push(booking_id),
                Ok(false) => {
                    tracing::warn!(
                        booking_id = %booking_id,
                        expired_at = %record.authorization_expires_at,
                        "authorization lapsed on an active booking; re-authorization required"
                    );
                    report.needs_reauthorization.push(booking_id);
                },
                Err(e) => {
                    tracing::error!(booking_id = %booking_id, error = %e, "sweep failed for booking");
                    report.failed.push(booking_id);
                },
            }
        }

        tracing::info!(
            cancelled = report.cancelled.len(),
            needs_reauthorization = report.needs_reauthorization.len(),
            failed = report.failed.len(),
            "authorization sweep finished"
        );
        Ok(report)
    }

    /// Cancel a not-yet-started booking whose hold lapsed. `Ok(false)` if it
    /// has already started.
    async fn expire(&self, booking_id: BookingId) -> Result<bool> {
        let booking = self.booking(booking_id).await?;
        if !matches!(booking.status, BookingStatus::Pending | BookingStatus::Accepted) {
            return Ok(false);
        }
        self.payments.mark_expired(booking_id).await?;
        self.cancel_unpaid(
            booking_id,
            CancellationReason::AuthorizationExpired,
            &[BookingStatus::Pending, BookingStatus::Accepted],
        )
        .await?;
        Ok(true)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Cancel as the system if the booking is still in one of `from`,
    /// re-reading on version conflicts.
    async fn cancel_unpaid(
        &self,
        booking_id: BookingId,
        reason: CancellationReason,
        from: &[BookingStatus],
    ) -> Result<Option<Booking>> {
        let mut attempt = 1;
        loop {
            let booking = self.booking(booking_id).await?;
            if !from.contains(&booking.status) {
                tracing::info!(booking_id = %booking_id, status = %booking.status, "booking left cancellable state; not cancelling");
                return Ok(None);
            }
            let action = BookingAction::TransitionBooking {
                target: BookingStatus::Cancelled,
                actor: Actor::System,
                reason: Some(reason),
            };
            match self.apply(booking, action).await {
                Ok(applied) => {
                    run_effects(applied.effects).await;
                    return Ok(Some(applied.booking));
                },
                Err(BookingError::ConcurrentModification { .. }) if attempt < MAX_ATTEMPTS => {
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Capture on `completed`, release on `cancelled`, unless already done.
    async fn settle_payment(&self, booking: &Booking) -> Result<()> {
        let Some(record) = self.repository.load_payment(booking.id).await? else {
            return Ok(());
        };
        match booking.status {
            BookingStatus::Completed if record.is_live_authorization() => {
                self.payments.capture(booking.id).await?;
            },
            BookingStatus::Cancelled if record.is_live_authorization() => {
                self.payments.void(booking.id).await?;
            },
            _ => {},
        }
        Ok(())
    }

    /// Run a command through the booking reducer and store the result if it
    /// changed anything.
    async fn apply(&self, booking: Booking, action: BookingAction) -> Result<Applied> {
        let booking_id = booking.id;
        let mut state = BookingState::from_booking(booking.clone());
        let effects = self.decide(&mut state, action)?;
        let next = state
            .booking
            .ok_or_else(|| BookingError::booking_not_found(booking_id))?;

        if next == booking {
            return Ok(Applied {
                booking,
                changed: false,
                effects,
            });
        }
        let booking = self.repository.save_booking(next).await?;
        Ok(Applied {
            booking,
            changed: true,
            effects,
        })
    }

    fn decide(&self, state: &mut BookingState, action: BookingAction) -> Result<Effects<BookingAction>> {
        let effects = self.reducer.reduce(state, action, &self.env);
        state.last_error.take().map_or(Ok(effects), Err)
    }

    fn decide_dispute(&self, state: &mut DisputeState, action: DisputeAction) -> Result<Effects<DisputeAction>> {
        let effects = self.disputes.reduce(state, action, &self.dispute_env);
        state.last_error.take().map_or(Ok(effects), Err)
    }
}

/// Run effects after the state they describe has been stored.
async fn run_effects<A: Send + 'static>(effects: Effects<A>) {
    for effect in effects {
        // Notifications feed nothing back.
        let _ = effect.run().await;
    }
}
