//! The booking status adjacency table and who may walk each edge.
//!
//! ```text
//! pending ──► accepted ──► in_progress ──► completed ──► disputed ──► resolved_captured
//!    │            │              │              │                 └─► resolved_refunded
//!    └────────────┴──────────────┴─► cancelled  │
//!                                        │      │
//!                                        └──────┴──► refunded
//! ```
//!
//! There is exactly one table. Every other module asks it before moving a
//! booking; there is no `pending → completed` shortcut.

use crate::types::Role;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Requested, awaiting the provider
    Pending,
    /// Provider accepted
    Accepted,
    /// Service underway
    InProgress,
    /// Service delivered; payment captured
    Completed,
    /// Requester contested a completed booking
    Disputed,
    /// Dispute closed in the provider's favour
    ResolvedCaptured,
    /// Dispute closed with a full or partial refund
    ResolvedRefunded,
    /// Called off before completion
    Cancelled,
    /// Money returned after completion or cancellation
    Refunded,
}

/// How an edge of the table may be driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    /// Ordinary lifecycle edge, driven by `transition`
    Lifecycle,
    /// `completed | cancelled → refunded`, driven by an explicit refund request
    Refund,
    /// Into or out of `disputed`, driven only by the dispute resolver
    Dispute,
}

impl BookingStatus {
    /// Every status, in path order.
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::Accepted,
        Self::InProgress,
        Self::Completed,
        Self::Cancelled,
        Self::Disputed,
        Self::Refunded,
        Self::ResolvedCaptured,
        Self::ResolvedRefunded,
    ];

    /// Statuses reachable in one step.
    #[must_use]
    pub const fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Accepted, Self::Cancelled],
            Self::Accepted => &[Self::InProgress, Self::Cancelled],
            Self::InProgress => &[Self::Completed, Self::Cancelled],
            Self::Completed => &[Self::Disputed, Self::Refunded],
            Self::Disputed => &[Self::ResolvedCaptured, Self::ResolvedRefunded],
            Self::Cancelled => &[Self::Refunded],
            Self::ResolvedCaptured | Self::ResolvedRefunded | Self::Refunded => &[],
        }
    }

    /// Whether `self → target` is an edge of the table.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Classify the edge `self → target`, or `None` if it is not an edge.
    #[must_use]
    pub fn edge_kind(self, target: Self) -> Option<EdgeKind> {
        if !self.can_transition_to(target) {
            return None;
        }
        Some(match (self, target) {
            (_, Self::Refunded) => EdgeKind::Refund,
            (Self::Completed, Self::Disputed) | (Self::Disputed, _) => EdgeKind::Dispute,
            _ => EdgeKind::Lifecycle,
        })
    }

    /// Terminal for the ordinary lifecycle.
    ///
    /// `completed` and `cancelled` are terminal but still admit the explicit
    /// refund edge, and `completed` admits the dispute edge.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Cancelled
                | Self::Refunded
                | Self::ResolvedCaptured
                | Self::ResolvedRefunded
        )
    }

    /// Whether the booking can still be cancelled.
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Pending | Self::Accepted | Self::InProgress)
    }

    /// Position along any path through the table. Statuses on the same rank
    /// are mutually exclusive.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Accepted => 1,
            Self::InProgress => 2,
            Self::Completed | Self::Cancelled => 3,
            Self::Disputed => 4,
            Self::Refunded | Self::ResolvedCaptured | Self::ResolvedRefunded => 5,
        }
    }

    /// Wire and storage name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Disputed => "disputed",
            Self::ResolvedCaptured => "resolved_captured",
            Self::ResolvedRefunded => "resolved_refunded",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown booking status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Whether `role` may drive the lifecycle edge `from → to`.
///
/// Only meaningful for [`EdgeKind::Lifecycle`] edges; refund and dispute
/// edges have their own entry points and rules.
#[must_use]
pub const fn may_transition(from: BookingStatus, to: BookingStatus, role: Role) -> bool {
    use BookingStatus::{Accepted, Cancelled, Completed, InProgress, Pending};

    match (from, to) {
        (Pending, Accepted) | (Accepted, InProgress) | (InProgress, Completed) => {
            matches!(role, Role::Provider)
        },
        (Pending | Accepted, Cancelled) => true,
        // Requesters cannot call off a service that is already underway.
        (InProgress, Cancelled) => matches!(role, Role::Provider | Role::Admin | Role::System),
        _ => false,
    }
}

/// Whether `role` may request the explicit refund edge.
#[must_use]
pub const fn may_refund(role: Role) -> bool {
    matches!(role, Role::Provider | Role::Admin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_no_shortcut_from_pending_to_completed() {
        assert!(!BookingStatus::Pending.can_transition_to(BookingStatus::Completed));
        assert_eq!(
            BookingStatus::Pending.edge_kind(BookingStatus::Completed),
            None
        );
    }

    #[test]
    fn test_edge_kinds() {
        use BookingStatus::*;
        assert_eq!(Pending.edge_kind(Accepted), Some(EdgeKind::Lifecycle));
        assert_eq!(InProgress.edge_kind(Cancelled), Some(EdgeKind::Lifecycle));
        assert_eq!(Completed.edge_kind(Refunded), Some(EdgeKind::Refund));
        assert_eq!(Cancelled.edge_kind(Refunded), Some(EdgeKind::Refund));
        assert_eq!(Completed.edge_kind(Disputed), Some(EdgeKind::Dispute));
        assert_eq!(Disputed.edge_kind(ResolvedRefunded), Some(EdgeKind::Dispute));
        assert_eq!(Disputed.edge_kind(Refunded), None);
    }

    #[test]
    fn test_terminal_states_have_no_lifecycle_edges() {
        for status in BookingStatus::ALL {
            if status.is_terminal() {
                assert!(
                    status
                        .valid_transitions()
                        .iter()
                        .all(|next| status.edge_kind(*next) != Some(EdgeKind::Lifecycle)),
                    "{status} is terminal but has a lifecycle edge"
                );
            }
        }
    }

    #[test]
    fn test_permissions() {
        use BookingStatus::*;
        assert!(may_transition(Pending, Accepted, Role::Provider));
        assert!(!may_transition(Pending, Accepted, Role::Requester));
        assert!(!may_transition(Pending, Accepted, Role::Admin));
        assert!(may_transition(Accepted, Cancelled, Role::Requester));
        assert!(may_transition(Pending, Cancelled, Role::System));
        assert!(!may_transition(InProgress, Cancelled, Role::Requester));
        assert!(may_transition(InProgress, Cancelled, Role::Provider));
        assert!(may_transition(InProgress, Cancelled, Role::Admin));
        assert!(!may_transition(InProgress, Completed, Role::Requester));
        assert!(may_refund(Role::Admin));
        assert!(!may_refund(Role::Requester));
    }

    #[test]
    fn test_status_names_round_trip_through_from_str() {
        for status in BookingStatus::ALL {
            assert_eq!(status.as_str().parse::<BookingStatus>(), Ok(status));
        }
        assert!("shipped".parse::<BookingStatus>().is_err());
    }

    proptest! {
        #[test]
        fn prop_every_edge_increases_rank(from in 0usize..9, to in 0usize..9) {
            let from = BookingStatus::ALL[from];
            let to = BookingStatus::ALL[to];
            if from.can_transition_to(to) {
                prop_assert!(to.rank() > from.rank());
            }
        }
    }
}
