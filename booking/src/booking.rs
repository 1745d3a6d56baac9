//! Booking aggregate.
//!
//! The reducer validates commands against the adjacency table in
//! [`crate::lifecycle`], applies the resulting events in place and describes
//! notifications as effects. Payment side effects are not effects of this
//! reducer: they need the stored booking version and are driven by
//! [`crate::coordinator::BookingService`] after the new state is persisted.

use crate::error::BookingError;
use crate::geo::ServiceRegion;
use crate::lifecycle::{self, BookingStatus, EdgeKind};
use crate::notifier::{self, Notification, Notifier};
use crate::pricing::PricingCalculator;
use crate::types::{
    Actor, BookingId, DisputeId, Locations, Money, PartyId, Role, Schedule, ServiceId, role_of,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skymarket_core::{SmallVec, effect::Effect, environment::Clock, reducer::Reducer, smallvec};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Entity
// ============================================================================

/// Why a booking was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// Requester called it off
    RequestedByRequester,
    /// Provider called it off
    RequestedByProvider,
    /// An admin called it off
    RequestedByAdmin,
    /// Authorization declined or failed
    PaymentFailed,
    /// Authorization lapsed before the service started
    AuthorizationExpired,
}

impl CancellationReason {
    /// Storage name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RequestedByRequester => "requested_by_requester",
            Self::RequestedByProvider => "requested_by_provider",
            Self::RequestedByAdmin => "requested_by_admin",
            Self::PaymentFailed => "payment_failed",
            Self::AuthorizationExpired => "authorization_expired",
        }
    }

    /// Parse a storage name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::RequestedByRequester,
            Self::RequestedByProvider,
            Self::RequestedByAdmin,
            Self::PaymentFailed,
            Self::AuthorizationExpired,
        ]
        .into_iter()
        .find(|reason| reason.as_str() == s)
    }

    const fn for_role(role: Role) -> Self {
        match role {
            Role::Requester => Self::RequestedByRequester,
            Role::Provider => Self::RequestedByProvider,
            Role::Admin => Self::RequestedByAdmin,
            Role::System => Self::PaymentFailed,
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a requester supplies to book a service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    /// Party asking for the service
    pub requester: PartyId,
    /// Party delivering it
    pub provider: PartyId,
    /// Catalog service
    pub service: ServiceId,
    /// When and how long
    pub schedule: Schedule,
    /// Pickup and delivery
    pub locations: Locations,
    /// Price the client displayed
    pub quoted_amount: Money,
}

/// One requester-provider engagement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    /// Identity
    pub id: BookingId,
    /// Current status
    pub status: BookingStatus,
    /// Party that requested the service
    pub requester: PartyId,
    /// Party delivering the service
    pub provider: PartyId,
    /// Catalog service
    pub service: ServiceId,
    /// When and how long
    pub schedule: Schedule,
    /// Pickup and delivery
    pub locations: Locations,
    /// Price fixed at creation
    pub quoted_amount: Money,
    /// Provider authorization id, once authorized
    pub payment_reference: Option<String>,
    /// Set when the booking was cancelled
    pub cancellation_reason: Option<CancellationReason>,
    /// Entered `pending`
    pub created_at: DateTime<Utc>,
    /// Entered `accepted`
    pub accepted_at: Option<DateTime<Utc>>,
    /// Entered `in_progress`
    pub started_at: Option<DateTime<Utc>>,
    /// Entered `completed`
    pub completed_at: Option<DateTime<Utc>>,
    /// Entered `disputed`
    pub disputed_at: Option<DateTime<Utc>>,
    /// Entered `resolved_captured` or `resolved_refunded`
    pub resolved_at: Option<DateTime<Utc>>,
    /// Entered `cancelled`
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Entered `refunded`
    pub refunded_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version (0 until first stored)
    pub version: u64,
}

impl Booking {
    /// Role of `actor` on this booking
    #[must_use]
    pub fn role_of(&self, actor: Actor) -> Option<Role> {
        role_of(actor, self.requester, self.provider)
    }

    /// When the booking entered `status`, if it did.
    #[must_use]
    pub const fn entered_at(&self, status: BookingStatus) -> Option<DateTime<Utc>> {
        match status {
            BookingStatus::Pending => Some(self.created_at),
            BookingStatus::Accepted => self.accepted_at,
            BookingStatus::InProgress => self.started_at,
            BookingStatus::Completed => self.completed_at,
            BookingStatus::Disputed => self.disputed_at,
            BookingStatus::ResolvedCaptured | BookingStatus::ResolvedRefunded => self.resolved_at,
            BookingStatus::Cancelled => self.cancelled_at,
            BookingStatus::Refunded => self.refunded_at,
        }
    }

    /// Statuses this booking has passed through, oldest first.
    ///
    /// Rebuilt from the populated timestamps; ties are broken by table rank.
    #[must_use]
    pub fn path(&self) -> Vec<(BookingStatus, DateTime<Utc>)> {
        let mut path: Vec<_> = BookingStatus::ALL
            .into_iter()
            .filter(|status| match status {
                // `resolved_at` is shared; only the current outcome was reached
                BookingStatus::ResolvedCaptured | BookingStatus::ResolvedRefunded => {
                    *status == self.status
                },
                _ => true,
            })
            .filter_map(|status| self.entered_at(status).map(|at| (status, at)))
            .collect();
        path.sort_by_key(|(status, at)| (*at, status.rank()));
        path
    }

    fn stamp(&mut self, status: BookingStatus, at: DateTime<Utc>) {
        let slot = match status {
            BookingStatus::Pending => return,
            BookingStatus::Accepted => &mut self.accepted_at,
            BookingStatus::InProgress => &mut self.started_at,
            BookingStatus::Completed => &mut self.completed_at,
            BookingStatus::Disputed => &mut self.disputed_at,
            BookingStatus::ResolvedCaptured | BookingStatus::ResolvedRefunded => {
                &mut self.resolved_at
            },
            BookingStatus::Cancelled => &mut self.cancelled_at,
            BookingStatus::Refunded => &mut self.refunded_at,
        };
        *slot = Some(at);
    }
}

// ============================================================================
// State
// ============================================================================

/// Reducer state: at most one booking.
#[derive(Clone, Debug, Default)]
pub struct BookingState {
    /// The booking, once created
    pub booking: Option<Booking>,
    /// Why the last command was rejected
    pub last_error: Option<BookingError>,
}

impl BookingState {
    /// State wrapping an existing booking
    #[must_use]
    pub const fn from_booking(booking: Booking) -> Self {
        Self {
            booking: Some(booking),
            last_error: None,
        }
    }

    /// Current status, if a booking exists
    #[must_use]
    pub fn status(&self) -> Option<BookingStatus> {
        self.booking.as_ref().map(|b| b.status)
    }
}

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// How a dispute ended, from the booking's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeOutcome {
    /// Capture stands
    Captured,
    /// Full or partial refund issued
    Refunded,
}

impl DisputeOutcome {
    const fn status(self) -> BookingStatus {
        match self {
            Self::Captured => BookingStatus::ResolvedCaptured,
            Self::Refunded => BookingStatus::ResolvedRefunded,
        }
    }
}

/// Actions for the Booking aggregate
#[derive(Clone, Debug)]
pub enum BookingAction {
    // Commands
    /// Create a booking from a request
    CreateBooking {
        /// Id to assign
        booking_id: BookingId,
        /// Request
        request: BookingRequest,
    },

    /// Move along a lifecycle edge
    TransitionBooking {
        /// Requested status
        target: BookingStatus,
        /// Who asks
        actor: Actor,
        /// Overrides the reason derived from the actor when cancelling
        reason: Option<CancellationReason>,
    },

    /// Record that money was returned (`completed | cancelled → refunded`)
    RecordRefund {
        /// Who asked for the refund
        actor: Actor,
    },

    /// Enter `disputed` (dispute resolver only)
    MarkDisputed {
        /// Dispute being opened
        dispute_id: DisputeId,
        /// Initiator
        actor: Actor,
    },

    /// Leave `disputed` (dispute resolver only)
    ResolveDispute {
        /// Dispute being resolved
        dispute_id: DisputeId,
        /// Arbitrator
        actor: Actor,
        /// Outcome
        outcome: DisputeOutcome,
    },

    // Events
    /// Booking was created
    BookingCreated {
        /// The new booking
        booking: Box<Booking>,
    },

    /// Booking changed status
    StatusChanged {
        /// Previous status
        from: BookingStatus,
        /// New status
        to: BookingStatus,
        /// Who drove the change
        actor: Actor,
        /// Set on cancellation
        reason: Option<CancellationReason>,
        /// When
        at: DateTime<Utc>,
    },

    /// Authorization id attached to the booking
    PaymentReferenceRecorded {
        /// Provider authorization id
        authorization_id: String,
    },

    /// Command was rejected
    CommandRejected {
        /// Why
        error: BookingError,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the Booking aggregate
#[derive(Clone)]
pub struct BookingEnvironment {
    /// Clock for timestamps
    pub clock: Arc<dyn Clock>,
    /// Where bookings may take place
    pub region: ServiceRegion,
    /// Rate card for quote verification
    pub pricing: PricingCalculator,
    /// Outbound notifications
    pub notifier: Arc<dyn Notifier>,
}

impl BookingEnvironment {
    /// Creates a new `BookingEnvironment`
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        region: ServiceRegion,
        pricing: PricingCalculator,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            clock,
            region,
            pricing,
            notifier,
        }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the Booking aggregate
#[derive(Clone, Copy, Debug, Default)]
pub struct BookingReducer;

impl BookingReducer {
    /// Creates a new `BookingReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Applies an event to state
    fn apply_event(state: &mut BookingState, action: &BookingAction) {
        match action {
            BookingAction::BookingCreated { booking } => {
                state.booking = Some((**booking).clone());
                state.last_error = None;
            },

            BookingAction::StatusChanged {
                to, reason, at, ..
            } => {
                if let Some(booking) = state.booking.as_mut() {
                    booking.status = *to;
                    booking.stamp(*to, *at);
                    if *to == BookingStatus::Cancelled {
                        booking.cancellation_reason = *reason;
                    }
                }
                state.last_error = None;
            },

            BookingAction::PaymentReferenceRecorded { authorization_id } => {
                if let Some(booking) = state.booking.as_mut() {
                    booking.payment_reference = Some(authorization_id.clone());
                }
                state.last_error = None;
            },

            BookingAction::CommandRejected { error } => {
                state.last_error = Some(error.clone());
            },

            // Commands don't modify state
            BookingAction::CreateBooking { .. }
            | BookingAction::TransitionBooking { .. }
            | BookingAction::RecordRefund { .. }
            | BookingAction::MarkDisputed { .. }
            | BookingAction::ResolveDispute { .. } => {},
        }
    }

    fn reject(state: &mut BookingState, error: BookingError) -> SmallVec<[Effect<BookingAction>; 4]> {
        tracing::warn!(error = %error, code = error.code(), "booking command rejected");
        Self::apply_event(state, &BookingAction::CommandRejected { error });
        SmallVec::new()
    }

    fn create(request: &BookingRequest, env: &BookingEnvironment) -> Result<(), BookingError> {
        if request.requester == request.provider {
            return Err(BookingError::InvalidRequest(
                "requester and provider must differ".to_string(),
            ));
        }
        if request.schedule.duration_minutes == 0 {
            return Err(BookingError::InvalidRequest(
                "duration must be at least one minute".to_string(),
            ));
        }
        env.region.validate(&request.locations)?;
        env.pricing
            .verify(request.quoted_amount, &request.locations, &request.schedule)?;
        Ok(())
    }

    /// Validate a lifecycle transition. `Ok(None)` is the idempotent no-op.
    fn check_transition(
        booking: &Booking,
        target: BookingStatus,
        actor: Actor,
    ) -> Result<Option<Role>, BookingError> {
        let Some(role) = booking.role_of(actor) else {
            return Err(BookingError::Unauthorized {
                actor,
                operation: format!("move booking {} to {target}", booking.id),
            });
        };
        if booking.status == target {
            return Ok(None);
        }
        match booking.status.edge_kind(target) {
            Some(EdgeKind::Lifecycle) => {
                if lifecycle::may_transition(booking.status, target, role) {
                    Ok(Some(role))
                } else {
                    Err(BookingError::Unauthorized {
                        actor,
                        operation: format!(
                            "move booking {} from {} to {target}",
                            booking.id, booking.status
                        ),
                    })
                }
            },
            Some(EdgeKind::Refund | EdgeKind::Dispute) | None => {
                Err(BookingError::IllegalTransition {
                    from: booking.status,
                    to: target,
                })
            },
        }
    }

    /// Validate one of the dedicated (refund, dispute) entry points.
    fn check_dedicated(
        booking: &Booking,
        target: BookingStatus,
        actor: Actor,
        allowed: fn(Role) -> bool,
        operation: &str,
    ) -> Result<bool, BookingError> {
        if !booking.role_of(actor).is_some_and(allowed) {
            return Err(BookingError::Unauthorized {
                actor,
                operation: format!("{operation} booking {}", booking.id),
            });
        }
        if booking.status == target {
            return Ok(false);
        }
        if booking.status.edge_kind(target).is_none() {
            return Err(BookingError::IllegalTransition {
                from: booking.status,
                to: target,
            });
        }
        Ok(true)
    }

    fn change_status(
        state: &mut BookingState,
        to: BookingStatus,
        actor: Actor,
        reason: Option<CancellationReason>,
        env: &BookingEnvironment,
    ) -> SmallVec<[Effect<BookingAction>; 4]> {
        let Some(booking) = state.booking.as_ref() else {
            return SmallVec::new();
        };
        let booking_id = booking.id;
        let from = booking.status;
        // Timestamps never go backwards along a path, even if the clock does.
        let at = booking
            .entered_at(from)
            .map_or_else(|| env.clock.now(), |prev| prev.max(env.clock.now()));

        Self::apply_event(
            state,
            &BookingAction::StatusChanged {
                from,
                to,
                actor,
                reason,
                at,
            },
        );

        tracing::info!(
            booking_id = %booking_id,
            from = %from,
            to = %to,
            actor = %actor,
            "booking status changed"
        );

        smallvec![Effect::fire_and_forget(notifier::deliver(
            Arc::clone(&env.notifier),
            Notification::StatusChanged {
                booking_id,
                from,
                to,
                actor,
            },
        ))]
    }
}

impl Reducer for BookingReducer {
    type State = BookingState;
    type Action = BookingAction;
    type Environment = BookingEnvironment;

    #[allow(clippy::too_many_lines)]
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Create ==========
            BookingAction::CreateBooking {
                booking_id,
                request,
            } => {
                if state.booking.is_some() {
                    return Self::reject(
                        state,
                        BookingError::InvalidRequest(format!("booking {booking_id} already exists")),
                    );
                }
                if let Err(error) = Self::create(&request, env) {
                    return Self::reject(state, error);
                }

                let booking = Booking {
                    id: booking_id,
                    status: BookingStatus::Pending,
                    requester: request.requester,
                    provider: request.provider,
                    service: request.service,
                    schedule: request.schedule,
                    locations: request.locations,
                    quoted_amount: request.quoted_amount,
                    payment_reference: None,
                    cancellation_reason: None,
                    created_at: env.clock.now(),
                    accepted_at: None,
                    started_at: None,
                    completed_at: None,
                    disputed_at: None,
                    resolved_at: None,
                    cancelled_at: None,
                    refunded_at: None,
                    version: 0,
                };
                Self::apply_event(
                    state,
                    &BookingAction::BookingCreated {
                        booking: Box::new(booking),
                    },
                );

                tracing::info!(
                    booking_id = %booking_id,
                    requester = %request.requester,
                    provider = %request.provider,
                    amount = %request.quoted_amount,
                    "booking created"
                );

                smallvec![Effect::fire_and_forget(notifier::deliver(
                    Arc::clone(&env.notifier),
                    Notification::BookingCreated {
                        booking_id,
                        requester: request.requester,
                        provider: request.provider,
                    },
                ))]
            },

            // ========== Lifecycle transitions ==========
            BookingAction::TransitionBooking {
                target,
                actor,
                reason,
            } => {
                let Some(booking) = state.booking.as_ref() else {
                    return Self::reject(
                        state,
                        BookingError::InvalidRequest("no booking to transition".to_string()),
                    );
                };
                match Self::check_transition(booking, target, actor) {
                    Ok(Some(role)) => {
                        let reason = (target == BookingStatus::Cancelled)
                            .then(|| reason.unwrap_or(CancellationReason::for_role(role)));
                        Self::change_status(state, target, actor, reason, env)
                    },
                    Ok(None) => {
                        state.last_error = None;
                        SmallVec::new()
                    },
                    Err(error) => Self::reject(state, error),
                }
            },

            // ========== Explicit refund ==========
            BookingAction::RecordRefund { actor } => {
                let Some(booking) = state.booking.as_ref() else {
                    return Self::reject(
                        state,
                        BookingError::InvalidRequest("no booking to refund".to_string()),
                    );
                };
                match Self::check_dedicated(
                    booking,
                    BookingStatus::Refunded,
                    actor,
                    lifecycle::may_refund,
                    "refund",
                ) {
                    Ok(true) => Self::change_status(state, BookingStatus::Refunded, actor, None, env),
                    Ok(false) => {
                        state.last_error = None;
                        SmallVec::new()
                    },
                    Err(error) => Self::reject(state, error),
                }
            },

            // ========== Dispute edges ==========
            BookingAction::MarkDisputed { dispute_id, actor } => {
                let Some(booking) = state.booking.as_ref() else {
                    return Self::reject(state, BookingError::dispute_not_found(dispute_id));
                };
                match Self::check_dedicated(
                    booking,
                    BookingStatus::Disputed,
                    actor,
                    |role| role == Role::Requester,
                    "dispute",
                ) {
                    Ok(true) => Self::change_status(state, BookingStatus::Disputed, actor, None, env),
                    // A second open on a disputed booking is not idempotent.
                    Ok(false) => Self::reject(
                        state,
                        BookingError::IllegalTransition {
                            from: BookingStatus::Disputed,
                            to: BookingStatus::Disputed,
                        },
                    ),
                    Err(error) => Self::reject(state, error),
                }
            },

            BookingAction::ResolveDispute {
                dispute_id,
                actor,
                outcome,
            } => {
                let Some(booking) = state.booking.as_ref() else {
                    return Self::reject(state, BookingError::dispute_not_found(dispute_id));
                };
                let target = outcome.status();
                if booking.status != BookingStatus::Disputed {
                    let from = booking.status;
                    return Self::reject(state, BookingError::IllegalTransition { from, to: target });
                }
                match Self::check_dedicated(booking, target, actor, |role| role == Role::Admin, "resolve")
                {
                    Ok(_) => Self::change_status(state, target, actor, None, env),
                    Err(error) => Self::reject(state, error),
                }
            },

            // ========== Events (from storage / replay) ==========
            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::geo::EARTH_RADIUS_MILES;
    use crate::notifier::RecordingNotifier;
    use crate::types::Coordinates;
    use chrono::Duration;
    use skymarket_testing::{ReducerTest, assertions, test_clock};

    /// Ten miles due north inside the Bay Area region.
    pub(crate) fn ten_mile_locations() -> Locations {
        let pickup = Coordinates::new(37.5, -122.3);
        let degrees = 10.0 / (EARTH_RADIUS_MILES * std::f64::consts::PI / 180.0);
        Locations {
            pickup,
            delivery: Coordinates::new(pickup.latitude + degrees, pickup.longitude),
        }
    }

    pub(crate) fn request(requester: PartyId, provider: PartyId) -> BookingRequest {
        BookingRequest {
            requester,
            provider,
            service: ServiceId::new(),
            schedule: Schedule {
                starts_at: skymarket_testing::epoch() + Duration::days(2),
                duration_minutes: 60,
            },
            locations: ten_mile_locations(),
            quoted_amount: Money::from_cents(4250),
        }
    }

    fn env() -> BookingEnvironment {
        BookingEnvironment::new(
            Arc::new(test_clock()),
            ServiceRegion::bay_area(),
            PricingCalculator::default(),
            Arc::new(RecordingNotifier::new()),
        )
    }

    fn booking_in(status: BookingStatus, requester: PartyId, provider: PartyId) -> BookingState {
        let mut state = BookingState::default();
        let reducer = BookingReducer::new();
        let env = env();
        let _ = reducer.reduce(
            &mut state,
            BookingAction::CreateBooking {
                booking_id: BookingId::new(),
                request: request(requester, provider),
            },
            &env,
        );
        let provider = Actor::Party(provider);
        let steps: &[BookingStatus] = match status {
            BookingStatus::Pending => &[],
            BookingStatus::Accepted => &[BookingStatus::Accepted],
            BookingStatus::InProgress => &[BookingStatus::Accepted, BookingStatus::InProgress],
            _ => &[
                BookingStatus::Accepted,
                BookingStatus::InProgress,
                BookingStatus::Completed,
            ],
        };
        for step in steps {
            let _ = reducer.reduce(
                &mut state,
                BookingAction::TransitionBooking {
                    target: *step,
                    actor: provider,
                    reason: None,
                },
                &env,
            );
        }
        assert_eq!(state.last_error, None);
        state
    }

    #[test]
    fn test_create_booking() {
        let requester = PartyId::new();
        let provider = PartyId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(BookingState::default())
            .when_action(BookingAction::CreateBooking {
                booking_id: BookingId::new(),
                request: request(requester, provider),
            })
            .then_state(move |state| {
                assert_eq!(state.last_error, None);
                let booking = state.booking.as_ref().unwrap();
                assert_eq!(booking.status, BookingStatus::Pending);
                assert_eq!(booking.quoted_amount, Money::from_cents(4250));
                assert_eq!(booking.created_at, skymarket_testing::epoch());
                assert_eq!(booking.version, 0);
            })
            .then_effects(assertions::assert_has_future_effect)
            .run();
    }

    #[test]
    fn test_create_rejects_bad_quote_and_location() {
        let mut bad_quote = request(PartyId::new(), PartyId::new());
        bad_quote.quoted_amount = Money::from_cents(4000);

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(BookingState::default())
            .when_action(BookingAction::CreateBooking {
                booking_id: BookingId::new(),
                request: bad_quote,
            })
            .then_state(|state| {
                assert!(state.booking.is_none());
                assert!(matches!(
                    state.last_error,
                    Some(BookingError::InvalidQuote { .. })
                ));
            })
            .then_effects(assertions::assert_no_effects)
            .run();

        let mut far_away = request(PartyId::new(), PartyId::new());
        far_away.locations.pickup = Coordinates::new(40.7128, -74.0060);

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(BookingState::default())
            .when_action(BookingAction::CreateBooking {
                booking_id: BookingId::new(),
                request: far_away,
            })
            .then_state(|state| {
                assert!(matches!(
                    state.last_error,
                    Some(BookingError::InvalidLocation { .. })
                ));
            })
            .run();
    }

    #[test]
    fn test_provider_accepts() {
        let requester = PartyId::new();
        let provider = PartyId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::Pending, requester, provider))
            .when_action(BookingAction::TransitionBooking {
                target: BookingStatus::Accepted,
                actor: Actor::Party(provider),
                reason: None,
            })
            .then_state(|state| {
                let booking = state.booking.as_ref().unwrap();
                assert_eq!(booking.status, BookingStatus::Accepted);
                assert_eq!(booking.accepted_at, Some(skymarket_testing::epoch()));
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 1))
            .run();
    }

    #[test]
    fn test_requester_cannot_accept() {
        let requester = PartyId::new();
        let provider = PartyId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::Pending, requester, provider))
            .when_action(BookingAction::TransitionBooking {
                target: BookingStatus::Accepted,
                actor: Actor::Party(requester),
                reason: None,
            })
            .then_state(|state| {
                assert_eq!(state.status(), Some(BookingStatus::Pending));
                assert!(matches!(
                    state.last_error,
                    Some(BookingError::Unauthorized { .. })
                ));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_same_status_is_a_silent_no_op() {
        let requester = PartyId::new();
        let provider = PartyId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::Accepted, requester, provider))
            .when_action(BookingAction::TransitionBooking {
                target: BookingStatus::Accepted,
                actor: Actor::Party(provider),
                reason: None,
            })
            .then_state(|state| {
                assert_eq!(state.status(), Some(BookingStatus::Accepted));
                assert_eq!(state.last_error, None);
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_no_shortcut_to_completed() {
        let provider = PartyId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::Pending, PartyId::new(), provider))
            .when_action(BookingAction::TransitionBooking {
                target: BookingStatus::Completed,
                actor: Actor::Party(provider),
                reason: None,
            })
            .then_state(|state| {
                assert_eq!(
                    state.last_error,
                    Some(BookingError::IllegalTransition {
                        from: BookingStatus::Pending,
                        to: BookingStatus::Completed,
                    })
                );
            })
            .run();
    }

    #[test]
    fn test_dispute_edges_are_not_reachable_by_transition() {
        let requester = PartyId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::Completed, requester, PartyId::new()))
            .when_action(BookingAction::TransitionBooking {
                target: BookingStatus::Disputed,
                actor: Actor::Party(requester),
                reason: None,
            })
            .then_state(|state| {
                assert!(matches!(
                    state.last_error,
                    Some(BookingError::IllegalTransition { .. })
                ));
                assert_eq!(state.status(), Some(BookingStatus::Completed));
            })
            .run();
    }

    #[test]
    fn test_requester_cannot_cancel_in_progress() {
        let requester = PartyId::new();
        let provider = PartyId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::InProgress, requester, provider))
            .when_action(BookingAction::TransitionBooking {
                target: BookingStatus::Cancelled,
                actor: Actor::Party(requester),
                reason: None,
            })
            .then_state(|state| {
                assert!(matches!(
                    state.last_error,
                    Some(BookingError::Unauthorized { .. })
                ));
            })
            .run();
    }

    #[test]
    fn test_cancellation_records_reason() {
        let requester = PartyId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::Accepted, requester, PartyId::new()))
            .when_action(BookingAction::TransitionBooking {
                target: BookingStatus::Cancelled,
                actor: Actor::Party(requester),
                reason: None,
            })
            .then_state(|state| {
                let booking = state.booking.as_ref().unwrap();
                assert_eq!(booking.status, BookingStatus::Cancelled);
                assert_eq!(
                    booking.cancellation_reason,
                    Some(CancellationReason::RequestedByRequester)
                );
                assert!(booking.cancelled_at.is_some());
            })
            .run();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::Pending, PartyId::new(), PartyId::new()))
            .when_action(BookingAction::TransitionBooking {
                target: BookingStatus::Cancelled,
                actor: Actor::System,
                reason: Some(CancellationReason::PaymentFailed),
            })
            .then_state(|state| {
                assert_eq!(
                    state.booking.as_ref().unwrap().cancellation_reason,
                    Some(CancellationReason::PaymentFailed)
                );
            })
            .run();
    }

    #[test]
    fn test_refund_edge_requires_provider_or_admin() {
        let requester = PartyId::new();
        let provider = PartyId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::Completed, requester, provider))
            .when_action(BookingAction::RecordRefund {
                actor: Actor::Party(requester),
            })
            .then_state(|state| {
                assert!(matches!(
                    state.last_error,
                    Some(BookingError::Unauthorized { .. })
                ));
            })
            .run();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::Completed, requester, provider))
            .when_action(BookingAction::RecordRefund {
                actor: Actor::Party(provider),
            })
            .then_state(|state| {
                let booking = state.booking.as_ref().unwrap();
                assert_eq!(booking.status, BookingStatus::Refunded);
                assert!(booking.refunded_at.is_some());
            })
            .then_effects(assertions::assert_has_future_effect)
            .run();
    }

    #[test]
    fn test_dispute_round_trip() {
        let requester = PartyId::new();
        let admin = Actor::Admin(PartyId::new());
        let dispute_id = DisputeId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::Completed, requester, PartyId::new()))
            .when_action(BookingAction::MarkDisputed {
                dispute_id,
                actor: Actor::Party(requester),
            })
            .when_action(BookingAction::ResolveDispute {
                dispute_id,
                actor: admin,
                outcome: DisputeOutcome::Refunded,
            })
            .then_state(|state| {
                assert_eq!(state.last_error, None);
                let booking = state.booking.as_ref().unwrap();
                assert_eq!(booking.status, BookingStatus::ResolvedRefunded);
                let statuses: Vec<_> = booking.path().into_iter().map(|(s, _)| s).collect();
                assert_eq!(
                    statuses,
                    vec![
                        BookingStatus::Pending,
                        BookingStatus::Accepted,
                        BookingStatus::InProgress,
                        BookingStatus::Completed,
                        BookingStatus::Disputed,
                        BookingStatus::ResolvedRefunded,
                    ]
                );
            })
            .run();
    }

    #[test]
    fn test_only_admin_resolves() {
        let requester = PartyId::new();
        let dispute_id = DisputeId::new();

        ReducerTest::new(BookingReducer::new())
            .with_env(env())
            .given_state(booking_in(BookingStatus::Completed, requester, PartyId::new()))
            .when_action(BookingAction::MarkDisputed {
                dispute_id,
                actor: Actor::Party(requester),
            })
            .when_action(BookingAction::ResolveDispute {
                dispute_id,
                actor: Actor::Party(requester),
                outcome: DisputeOutcome::Refunded,
            })
            .then_state(|state| {
                assert_eq!(state.status(), Some(BookingStatus::Disputed));
                assert!(matches!(
                    state.last_error,
                    Some(BookingError::Unauthorized { .. })
                ));
            })
            .run();
    }
}
