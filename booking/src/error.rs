//! Error taxonomy for the booking lifecycle.
//!
//! Every failure a caller can see is a [`BookingError`]. Each variant knows its
//! [`ErrorCategory`] and whether the caller should try again or contact support.

use crate::lifecycle::BookingStatus;
use crate::types::{Actor, BookingId, DisputeId, LocationKind, Money};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, BookingError>;

/// Coarse classification used for logging and HTTP mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input; never retried by the core
    Validation,
    /// Actor lacks permission
    Authorization,
    /// Entity is not in a state that allows the request
    State,
    /// Payment provider or other dependency
    External,
    /// Storage or unexpected internal failure
    Internal,
}

/// Errors returned by booking, payment and dispute operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookingError {
    /// A coordinate is outside the service region
    #[error("{which} location {latitude},{longitude} is outside the service region")]
    InvalidLocation {
        /// Which point failed
        which: LocationKind,
        /// Offending latitude, formatted
        latitude: String,
        /// Offending longitude, formatted
        longitude: String,
    },

    /// Client quote disagrees with the recomputed price
    #[error("quoted {quoted} does not match computed price {expected}")]
    InvalidQuote {
        /// Amount the client quoted
        quoted: Money,
        /// Amount the pricing calculator produced
        expected: Money,
    },

    /// Malformed request that fits no other validation error
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Actor is not allowed to perform the operation
    #[error("{actor} is not allowed to {operation}")]
    Unauthorized {
        /// Who asked
        actor: Actor,
        /// What they asked for
        operation: String,
    },

    /// Edge not in the adjacency table (or not drivable from this entry point)
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition {
        /// Current status
        from: BookingStatus,
        /// Requested status
        to: BookingStatus,
    },

    /// Optimistic version check failed; re-read and retry
    #[error("{entity} {id} was modified concurrently")]
    ConcurrentModification {
        /// Entity kind
        entity: &'static str,
        /// Entity id
        id: String,
    },

    /// Booking left `completed` before capture could run
    #[error("booking {booking_id} is {actual}, expected {expected}")]
    StateChangedConcurrently {
        /// Booking being captured
        booking_id: BookingId,
        /// Status the operation required
        expected: BookingStatus,
        /// Status found
        actual: BookingStatus,
    },

    /// Dispute already resolved
    #[error("dispute {0} is closed")]
    DisputeClosed(DisputeId),

    /// Too late to open a dispute
    #[error("dispute window of {window_days} days after {completed_at} has passed")]
    DisputeWindowExpired {
        /// Configured window
        window_days: i64,
        /// When the booking completed
        completed_at: DateTime<Utc>,
    },

    /// Provider declined the authorization
    #[error("payment declined for booking {booking_id}: {reason}")]
    PaymentDeclined {
        /// Booking that was cancelled as a result
        booking_id: BookingId,
        /// Provider's reason
        reason: String,
    },

    /// Authorization lapsed before capture
    #[error("authorization for booking {booking_id} expired at {expired_at}")]
    CaptureWindowExpired {
        /// Booking whose capture failed
        booking_id: BookingId,
        /// When the authorization lapsed
        expired_at: DateTime<Utc>,
    },

    /// Provider timed out or is down
    #[error("payment provider unavailable during {operation}: {reason}")]
    PaymentProviderUnavailable {
        /// Provider call that failed
        operation: &'static str,
        /// Detail
        reason: String,
    },

    /// Refund larger than what remains refundable
    #[error("refund of {requested} exceeds refundable {refundable}")]
    RefundExceedsCaptured {
        /// Amount asked for
        requested: Money,
        /// `captured - refunded`
        refundable: Money,
    },

    /// Entity not found
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Entity id
        id: String,
    },

    /// Repository failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl BookingError {
    /// Shorthand for a missing booking
    #[must_use]
    pub fn booking_not_found(id: BookingId) -> Self {
        Self::NotFound {
            entity: "booking",
            id: id.to_string(),
        }
    }

    /// Shorthand for a missing dispute
    #[must_use]
    pub fn dispute_not_found(id: DisputeId) -> Self {
        Self::NotFound {
            entity: "dispute",
            id: id.to_string(),
        }
    }

    /// Shorthand for a missing payment record
    #[must_use]
    pub fn payment_not_found(booking_id: BookingId) -> Self {
        Self::NotFound {
            entity: "payment_record",
            id: booking_id.to_string(),
        }
    }

    /// Classification of this error
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidLocation { .. }
            | Self::InvalidQuote { .. }
            | Self::InvalidRequest(_)
            | Self::RefundExceedsCaptured { .. }
            | Self::NotFound { .. } => ErrorCategory::Validation,
            Self::Unauthorized { .. } => ErrorCategory::Authorization,
            Self::IllegalTransition { .. }
            | Self::ConcurrentModification { .. }
            | Self::StateChangedConcurrently { .. }
            | Self::DisputeClosed(_)
            | Self::DisputeWindowExpired { .. } => ErrorCategory::State,
            Self::PaymentDeclined { .. }
            | Self::CaptureWindowExpired { .. }
            | Self::PaymentProviderUnavailable { .. } => ErrorCategory::External,
            Self::Storage(_) => ErrorCategory::Internal,
        }
    }

    /// `true` when re-reading state and trying again can succeed; `false`
    /// means the request must change or support has to step in.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. }
                | Self::StateChangedConcurrently { .. }
                | Self::PaymentProviderUnavailable { .. }
        )
    }

    /// Stable machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidLocation { .. } => "INVALID_LOCATION",
            Self::InvalidQuote { .. } => "INVALID_QUOTE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::StateChangedConcurrently { .. } => "STATE_CHANGED_CONCURRENTLY",
            Self::DisputeClosed(_) => "DISPUTE_CLOSED",
            Self::DisputeWindowExpired { .. } => "DISPUTE_WINDOW_EXPIRED",
            Self::PaymentDeclined { .. } => "PAYMENT_DECLINED",
            Self::CaptureWindowExpired { .. } => "CAPTURE_WINDOW_EXPIRED",
            Self::PaymentProviderUnavailable { .. } => "PAYMENT_PROVIDER_UNAVAILABLE",
            Self::RefundExceedsCaptured { .. } => "REFUND_EXCEEDS_CAPTURED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Human guidance for external-dependency failures.
    #[must_use]
    pub const fn guidance(&self) -> &'static str {
        if self.is_retryable() {
            "try again"
        } else if matches!(self.category(), ErrorCategory::External | ErrorCategory::Internal) {
            "contact support"
        } else {
            "fix the request"
        }
    }
}
