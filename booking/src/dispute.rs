//! Dispute aggregate: the contested sub-flow after completion.
//!
//! ```text
//! open ──► responded ──► resolved
//!   └────────────────────────┘
//! ```
//!
//! The dispute reducer owns the dispute record only. Moving the booking into
//! and out of `disputed` goes through [`crate::booking::BookingAction`], and
//! refunds through the payment coordinator; [`crate::coordinator::BookingService`]
//! ties the three together.

use crate::booking::{Booking, DisputeOutcome};
use crate::error::BookingError;
use crate::lifecycle::BookingStatus;
use crate::notifier::{self, Notification, Notifier};
use crate::types::{Actor, BookingId, DisputeId, Money, PartyId, Role, role_of};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use skymarket_core::{SmallVec, effect::Effect, environment::Clock, reducer::Reducer, smallvec};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Entity
// ============================================================================

/// Why the requester contests the booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeReason {
    /// Service never happened
    ServiceNotRendered,
    /// Goods arrived damaged
    DamagedGoods,
    /// Delivered late
    LateDelivery,
    /// Charged more than agreed
    Overcharged,
    /// Anything else; see the description
    Other,
}

impl DisputeReason {
    /// Storage name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServiceNotRendered => "service_not_rendered",
            Self::DamagedGoods => "damaged_goods",
            Self::LateDelivery => "late_delivery",
            Self::Overcharged => "overcharged",
            Self::Other => "other",
        }
    }

    /// Parse a storage name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::ServiceNotRendered,
            Self::DamagedGoods,
            Self::LateDelivery,
            Self::Overcharged,
            Self::Other,
        ]
        .into_iter()
        .find(|reason| reason.as_str() == s)
    }
}

/// Dispute status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    /// Opened, no answer yet
    Open,
    /// At least one response recorded
    Responded,
    /// Closed by an arbitrator
    Resolved,
}

impl DisputeStatus {
    /// Storage name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Responded => "responded",
            Self::Resolved => "resolved",
        }
    }

    /// Parse a storage name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [Self::Open, Self::Responded, Self::Resolved]
            .into_iter()
            .find(|status| status.as_str() == s)
    }

    /// Statuses reachable in one step
    #[must_use]
    pub const fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Open => &[Self::Responded, Self::Resolved],
            Self::Responded => &[Self::Resolved],
            Self::Resolved => &[],
        }
    }

    /// Whether the dispute still accepts input
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Resolved)
    }
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arbitrator's decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The capture stands
    CaptureConfirmed,
    /// Everything still refundable goes back
    Refunded,
    /// A stated amount goes back
    PartialRefund,
}

impl Resolution {
    /// Booking-side outcome
    #[must_use]
    pub const fn outcome(self) -> DisputeOutcome {
        match self {
            Self::CaptureConfirmed => DisputeOutcome::Captured,
            Self::Refunded | Self::PartialRefund => DisputeOutcome::Refunded,
        }
    }

    /// Storage name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CaptureConfirmed => "capture_confirmed",
            Self::Refunded => "refunded",
            Self::PartialRefund => "partial_refund",
        }
    }
}

/// One message in the dispute log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResponse {
    /// Who wrote it
    pub responder: Actor,
    /// What they wrote
    pub message: String,
    /// When
    pub at: DateTime<Utc>,
}

/// Recorded decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeDecision {
    /// Decision
    pub resolution: Resolution,
    /// Amount refunded because of this dispute
    pub refunded: Money,
    /// Arbitrator
    pub resolved_by: Actor,
}

/// A contest over a completed booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    /// Identity
    pub id: DisputeId,
    /// Contested booking
    pub booking_id: BookingId,
    /// Booking's requester (the initiator)
    pub requester: PartyId,
    /// Booking's provider
    pub provider: PartyId,
    /// Why
    pub reason: DisputeReason,
    /// Free text from the initiator
    pub description: String,
    /// Status
    pub status: DisputeStatus,
    /// Set once resolved
    pub decision: Option<DisputeDecision>,
    /// Ordered message log
    pub responses: Vec<DisputeResponse>,
    /// When opened
    pub opened_at: DateTime<Utc>,
    /// When resolved
    pub resolved_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version (0 until first stored)
    pub version: u64,
}

impl Dispute {
    /// Role of `actor` in this dispute
    #[must_use]
    pub fn role_of(&self, actor: Actor) -> Option<Role> {
        role_of(actor, self.requester, self.provider)
    }
}

// ============================================================================
// State / Actions / Environment
// ============================================================================

/// Reducer state: at most one dispute.
#[derive(Clone, Debug, Default)]
pub struct DisputeState {
    /// The dispute, once opened
    pub dispute: Option<Dispute>,
    /// Why the last command was rejected
    pub last_error: Option<BookingError>,
}

impl DisputeState {
    /// State wrapping an existing dispute
    #[must_use]
    pub const fn from_dispute(dispute: Dispute) -> Self {
        Self {
            dispute: Some(dispute),
            last_error: None,
        }
    }
}

/// Actions for the Dispute aggregate
#[derive(Clone, Debug)]
pub enum DisputeAction {
    // Commands
    /// Open a dispute on a completed booking
    OpenDispute {
        /// Id to assign
        dispute_id: DisputeId,
        /// Booking as currently stored
        booking: Box<Booking>,
        /// Who opens it
        initiator: Actor,
        /// Why
        reason: DisputeReason,
        /// Details
        description: String,
    },

    /// Append to the response log
    Respond {
        /// Who answers
        responder: Actor,
        /// Message
        message: String,
    },

    /// Close the dispute
    Resolve {
        /// Arbitrator
        actor: Actor,
        /// Decision
        resolution: Resolution,
        /// Amount refunded for this dispute (zero when the capture stands)
        refunded: Money,
    },

    // Events
    /// Dispute opened
    DisputeOpened {
        /// The new dispute
        dispute: Box<Dispute>,
    },

    /// Response appended
    ResponseRecorded {
        /// The response
        response: DisputeResponse,
    },

    /// Dispute resolved
    DisputeResolved {
        /// Decision
        decision: DisputeDecision,
        /// When
        at: DateTime<Utc>,
    },

    /// Command was rejected
    CommandRejected {
        /// Why
        error: BookingError,
    },
}

/// Environment dependencies for the Dispute aggregate
#[derive(Clone)]
pub struct DisputeEnvironment {
    /// Clock for timestamps and the window check
    pub clock: Arc<dyn Clock>,
    /// How long after completion a dispute may be opened
    pub window: Duration,
    /// Outbound notifications
    pub notifier: Arc<dyn Notifier>,
}

impl DisputeEnvironment {
    /// Creates a new `DisputeEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, window: Duration, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            clock,
            window,
            notifier,
        }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the Dispute aggregate
#[derive(Clone, Copy, Debug, Default)]
pub struct DisputeReducer;

impl DisputeReducer {
    /// Creates a new `DisputeReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn apply_event(state: &mut DisputeState, action: &DisputeAction) {
        match action {
            DisputeAction::DisputeOpened { dispute } => {
                state.dispute = Some((**dispute).clone());
                state.last_error = None;
            },
            DisputeAction::ResponseRecorded { response } => {
                if let Some(dispute) = state.dispute.as_mut() {
                    dispute.responses.push(response.clone());
                    if dispute.status == DisputeStatus::Open {
                        dispute.status = DisputeStatus::Responded;
                    }
                }
                state.last_error = None;
            },
            DisputeAction::DisputeResolved { decision, at } => {
                if let Some(dispute) = state.dispute.as_mut() {
                    dispute.status = DisputeStatus::Resolved;
                    dispute.decision = Some(decision.clone());
                    dispute.resolved_at = Some(*at);
                }
                state.last_error = None;
            },
            DisputeAction::CommandRejected { error } => {
                state.last_error = Some(error.clone());
            },
            DisputeAction::OpenDispute { .. }
            | DisputeAction::Respond { .. }
            | DisputeAction::Resolve { .. } => {},
        }
    }

    fn reject(state: &mut DisputeState, error: BookingError) -> SmallVec<[Effect<DisputeAction>; 4]> {
        tracing::warn!(error = %error, code = error.code(), "dispute command rejected");
        Self::apply_event(state, &DisputeAction::CommandRejected { error });
        SmallVec::new()
    }

    fn check_open(
        booking: &Booking,
        initiator: Actor,
        env: &DisputeEnvironment,
    ) -> Result<(), BookingError> {
        if booking.role_of(initiator) != Some(Role::Requester) {
            return Err(BookingError::Unauthorized {
                actor: initiator,
                operation: format!("open a dispute on booking {}", booking.id),
            });
        }
        let completed_at = match (booking.status, booking.completed_at) {
            (BookingStatus::Completed, Some(at)) => at,
            (from, _) => {
                return Err(BookingError::IllegalTransition {
                    from,
                    to: BookingStatus::Disputed,
                });
            },
        };
        if env.clock.now() - completed_at > env.window {
            return Err(BookingError::DisputeWindowExpired {
                window_days: env.window.num_days(),
                completed_at,
            });
        }
        Ok(())
    }
}

impl Reducer for DisputeReducer {
    type State = DisputeState;
    type Action = DisputeAction;
    type Environment = DisputeEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            DisputeAction::OpenDispute {
                dispute_id,
                booking,
                initiator,
                reason,
                description,
            } => {
                if state.dispute.is_some() {
                    return Self::reject(
                        state,
                        BookingError::InvalidRequest(format!("dispute {dispute_id} already exists")),
                    );
                }
                if let Err(error) = Self::check_open(&booking, initiator, env) {
                    return Self::reject(state, error);
                }

                let dispute = Dispute {
                    id: dispute_id,
                    booking_id: booking.id,
                    requester: booking.requester,
                    provider: booking.provider,
                    reason,
                    description,
                    status: DisputeStatus::Open,
                    decision: None,
                    responses: Vec::new(),
                    opened_at: env.clock.now(),
                    resolved_at: None,
                    version: 0,
                };
                Self::apply_event(
                    state,
                    &DisputeAction::DisputeOpened {
                        dispute: Box::new(dispute),
                    },
                );

                tracing::info!(
                    dispute_id = %dispute_id,
                    booking_id = %booking.id,
                    reason = reason.as_str(),
                    "dispute opened"
                );

                smallvec![Effect::fire_and_forget(notifier::deliver(
                    Arc::clone(&env.notifier),
                    Notification::DisputeOpened {
                        dispute_id,
                        booking_id: booking.id,
                    },
                ))]
            },

            DisputeAction::Respond { responder, message } => {
                let Some(dispute) = state.dispute.as_ref() else {
                    return Self::reject(
                        state,
                        BookingError::InvalidRequest("no dispute to respond to".to_string()),
                    );
                };
                let dispute_id = dispute.id;
                if dispute.status.is_closed() {
                    return Self::reject(state, BookingError::DisputeClosed(dispute_id));
                }
                if dispute.role_of(responder).is_none_or(|role| role == Role::System) {
                    return Self::reject(
                        state,
                        BookingError::Unauthorized {
                            actor: responder,
                            operation: format!("respond to dispute {dispute_id}"),
                        },
                    );
                }
                if message.trim().is_empty() {
                    return Self::reject(
                        state,
                        BookingError::InvalidRequest("response message is empty".to_string()),
                    );
                }

                Self::apply_event(
                    state,
                    &DisputeAction::ResponseRecorded {
                        response: DisputeResponse {
                            responder,
                            message,
                            at: env.clock.now(),
                        },
                    },
                );

                tracing::info!(dispute_id = %dispute_id, responder = %responder, "dispute response recorded");

                smallvec![Effect::fire_and_forget(notifier::deliver(
                    Arc::clone(&env.notifier),
                    Notification::DisputeResponded {
                        dispute_id,
                        responder,
                    },
                ))]
            },

            DisputeAction::Resolve {
                actor,
                resolution,
                refunded,
            } => {
                let Some(dispute) = state.dispute.as_ref() else {
                    return Self::reject(
                        state,
                        BookingError::InvalidRequest("no dispute to resolve".to_string()),
                    );
                };
                let dispute_id = dispute.id;
                if dispute.status.is_closed() {
                    return Self::reject(state, BookingError::DisputeClosed(dispute_id));
                }
                if dispute.role_of(actor) != Some(Role::Admin) {
                    return Self::reject(
                        state,
                        BookingError::Unauthorized {
                            actor,
                            operation: format!("resolve dispute {dispute_id}"),
                        },
                    );
                }

                Self::apply_event(
                    state,
                    &DisputeAction::DisputeResolved {
                        decision: DisputeDecision {
                            resolution,
                            refunded,
                            resolved_by: actor,
                        },
                        at: env.clock.now(),
                    },
                );

                tracing::info!(
                    dispute_id = %dispute_id,
                    resolution = resolution.as_str(),
                    refunded = %refunded,
                    "dispute resolved"
                );

                smallvec![Effect::fire_and_forget(notifier::deliver(
                    Arc::clone(&env.notifier),
                    Notification::DisputeResolved {
                        dispute_id,
                        resolution,
                    },
                ))]
            },

            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}
