//! Outbound notifications (email, push, chat) about bookings and disputes.
//!
//! Notifications are fire-and-forget: reducers return them as effects, the
//! service runs them after the state change is stored, and a failing notifier
//! is logged but never fails the operation.

use crate::dispute::Resolution;
use crate::lifecycle::BookingStatus;
use crate::types::{Actor, BookingId, DisputeId, PartyId};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

/// Something worth telling the parties of a booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A booking request was created
    BookingCreated {
        /// Booking
        booking_id: BookingId,
        /// Who asked
        requester: PartyId,
        /// Who is asked
        provider: PartyId,
    },
    /// A booking changed status
    StatusChanged {
        /// Booking
        booking_id: BookingId,
        /// Previous status
        from: BookingStatus,
        /// New status
        to: BookingStatus,
        /// Who drove the change
        actor: Actor,
    },
    /// A dispute was opened
    DisputeOpened {
        /// Dispute
        dispute_id: DisputeId,
        /// Contested booking
        booking_id: BookingId,
    },
    /// Someone answered in a dispute
    DisputeResponded {
        /// Dispute
        dispute_id: DisputeId,
        /// Who answered
        responder: Actor,
    },
    /// A dispute was closed
    DisputeResolved {
        /// Dispute
        dispute_id: DisputeId,
        /// Outcome
        resolution: Resolution,
    },
}

/// Notification delivery failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Notification delivery capability.
pub trait Notifier: Send + Sync {
    /// Deliver one notification
    ///
    /// # Errors
    ///
    /// Returns error if the channel rejected the message
    fn notify(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>>;
}

/// Writes notifications to the log (development).
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn Notifier> {
        Arc::new(Self)
    }
}

impl Notifier for LogNotifier {
    fn notify(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
        Box::pin(async move {
            match serde_json::to_string(&notification) {
                Ok(body) => tracing::info!(notification = %body, "notification"),
                Err(e) => tracing::info!(?notification, error = %e, "notification"),
            }
            Ok(())
        })
    }
}

/// Keeps every notification in memory; optionally fails each delivery.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: bool,
}

impl RecordingNotifier {
    /// A notifier that records and succeeds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier that records and then reports failure
    #[must_use]
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    /// Everything delivered so far, oldest first
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Status changes delivered for `booking_id`
    #[must_use]
    pub fn status_changes(&self, booking_id: BookingId) -> Vec<(BookingStatus, BookingStatus)> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::StatusChanged {
                    booking_id: id,
                    from,
                    to,
                    ..
                } if id == booking_id => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(
        &self,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
        Box::pin(async move {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(notification);
            if self.failing {
                return Err(NotifyError("mailbox unavailable".to_string()));
            }
            Ok(())
        })
    }
}

/// Deliver `notification` through `notifier`, logging failures.
pub(crate) async fn deliver(notifier: Arc<dyn Notifier>, notification: Notification) {
    if let Err(e) = notifier.notify(notification).await {
        tracing::warn!(error = %e, "notification not delivered");
    }
}
