//! Payment record: the local ledger of one booking's authorization.
//!
//! Pure bookkeeping. Provider calls live in
//! [`crate::coordinator::PaymentCoordinator`]; it asks the record what to do
//! (`plan_*`), calls the provider, then writes the outcome back (`record_*`).
//! Refunds are reserved (`reserve_refund`) and stored before the provider is
//! called, so two requests cannot both spend the same refundable balance.
//! Every mutation keeps `captured ≤ authorized` and `refunded ≤ captured`, and
//! status only moves forward: `authorized < captured < refunded`.

use crate::error::BookingError;
use crate::types::{BookingId, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Payment status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Funds held
    Authorized,
    /// Funds taken
    Captured,
    /// Funds returned (or authorization voided)
    Refunded,
    /// Authorization declined, failed or lapsed
    Failed,
}

impl PaymentStatus {
    /// Storage name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authorized => "authorized",
            Self::Captured => "captured",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }

    /// Parse a storage name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [Self::Authorized, Self::Captured, Self::Refunded, Self::Failed]
            .into_iter()
            .find(|status| status.as_str() == s)
    }

    /// Forward order of the money states; `Failed` is outside it.
    const fn rank(self) -> Option<u8> {
        match self {
            Self::Authorized => Some(0),
            Self::Captured => Some(1),
            Self::Refunded => Some(2),
            Self::Failed => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-supplied token making a refund request idempotent.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefundToken(String);

impl RefundToken {
    /// Wrap a client token
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token used for the refund a dispute resolution issues
    #[must_use]
    pub fn for_dispute(dispute_id: crate::types::DisputeId) -> Self {
        Self(format!("dispute-{dispute_id}"))
    }

    /// Placeholder token for a refund first heard of through a webhook
    #[must_use]
    pub fn for_provider(refund_id: &str) -> Self {
        Self(format!("provider:{refund_id}"))
    }

    /// Whether this is a [`RefundToken::for_provider`] placeholder
    #[must_use]
    pub fn is_provider(&self) -> bool {
        self.0.starts_with("provider:")
    }

    /// The token text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefundToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One refund (or void), applied or reserved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundEntry {
    /// Request token (or `provider:<refund id>` for refunds learned by webhook)
    pub token: RefundToken,
    /// Provider refund id; `None` for a void or a reservation
    pub refund_id: Option<String>,
    /// Amount returned (or held back while pending)
    pub amount: Money,
    /// When
    pub at: DateTime<Utc>,
    /// Reserved, provider call not yet confirmed
    #[serde(default)]
    pub pending: bool,
}

/// What a capture request should do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapturePlan {
    /// Already captured; nothing to do
    AlreadyCaptured,
    /// Capture `amount` on `authorization_id`
    Capture {
        /// Provider authorization id
        authorization_id: String,
        /// Full authorized amount
        amount: Money,
    },
}

/// What a refund request should do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefundPlan {
    /// Token already applied; return the record unchanged
    Replay,
    /// Hold already released and nothing captured; nothing left to return
    NothingHeld,
    /// Nothing captured yet; release the authorization
    Void {
        /// Provider authorization id
        authorization_id: String,
    },
    /// Refund `amount` against `capture_id`
    Refund {
        /// Provider capture id
        capture_id: String,
        /// Amount to return
        amount: Money,
    },
}

/// Local ledger for one booking's payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Owning booking
    pub booking_id: BookingId,
    /// Provider authorization id (absent when authorization failed outright)
    pub authorization_id: Option<String>,
    /// Provider capture id
    pub capture_id: Option<String>,
    /// Amount held
    pub authorized: Money,
    /// Amount taken
    pub captured: Money,
    /// Amount returned, cumulative
    pub refunded: Money,
    /// Status
    pub status: PaymentStatus,
    /// When the hold was placed
    pub authorized_at: DateTime<Utc>,
    /// When the hold lapses
    pub authorization_expires_at: DateTime<Utc>,
    /// Last failure reported by the provider
    pub failure_reason: Option<String>,
    /// One entry per distinct refund token
    pub refunds: Vec<RefundEntry>,
    /// Provider event ids already applied
    pub processed_events: BTreeSet<String>,
    /// Highest provider sequence applied
    pub last_event_sequence: Option<u64>,
    /// Optimistic concurrency version (0 until first stored)
    pub version: u64,
}

impl PaymentRecord {
    /// A successful authorization.
    #[must_use]
    pub fn authorized(
        booking_id: BookingId,
        authorization_id: String,
        amount: Money,
        authorized_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            booking_id,
            authorization_id: Some(authorization_id),
            capture_id: None,
            authorized: amount,
            captured: Money::ZERO,
            refunded: Money::ZERO,
            status: PaymentStatus::Authorized,
            authorized_at,
            authorization_expires_at: expires_at,
            failure_reason: None,
            refunds: Vec::new(),
            processed_events: BTreeSet::new(),
            last_event_sequence: None,
            version: 0,
        }
    }

    /// A declined authorization. Holds no money.
    #[must_use]
    pub fn declined(booking_id: BookingId, reason: String, at: DateTime<Utc>) -> Self {
        Self {
            booking_id,
            authorization_id: None,
            capture_id: None,
            authorized: Money::ZERO,
            captured: Money::ZERO,
            refunded: Money::ZERO,
            status: PaymentStatus::Failed,
            authorized_at: at,
            authorization_expires_at: at,
            failure_reason: Some(reason),
            refunds: Vec::new(),
            processed_events: BTreeSet::new(),
            last_event_sequence: None,
            version: 0,
        }
    }

    /// Whether funds are still held and not yet taken
    #[must_use]
    pub fn is_live_authorization(&self) -> bool {
        self.status == PaymentStatus::Authorized && self.captured.is_zero()
    }

    /// Whether the hold has lapsed at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.authorization_expires_at
    }

    /// Held back by refunds whose provider call has not been confirmed
    #[must_use]
    pub fn reserved(&self) -> Money {
        self.refunds
            .iter()
            .filter(|entry| entry.pending)
            .fold(Money::ZERO, |total, entry| total.saturating_add(entry.amount))
    }

    /// `captured − refunded − reserved`: what a new refund request may take
    #[must_use]
    pub fn refundable(&self) -> Money {
        self.unrefunded().saturating_sub(self.reserved())
    }

    /// `captured − refunded`, ignoring reservations
    const fn unrefunded(&self) -> Money {
        self.captured.saturating_sub(self.refunded)
    }

    /// Ledger entry for `token`, applied or reserved
    #[must_use]
    pub fn refund_for(&self, token: &RefundToken) -> Option<&RefundEntry> {
        self.refunds.iter().find(|entry| &entry.token == token)
    }

    fn authorization_id(&self) -> Result<String, BookingError> {
        self.authorization_id.clone().ok_or_else(|| {
            BookingError::InvalidRequest(format!(
                "booking {} has no authorization on file",
                self.booking_id
            ))
        })
    }

    /// Decide what a capture request should do at `now`.
    ///
    /// # Errors
    ///
    /// - [`BookingError::CaptureWindowExpired`] if the hold lapsed
    /// - [`BookingError::InvalidRequest`] if the record is failed or refunded
    pub fn plan_capture(&self, now: DateTime<Utc>) -> Result<CapturePlan, BookingError> {
        match self.status {
            PaymentStatus::Captured => Ok(CapturePlan::AlreadyCaptured),
            PaymentStatus::Authorized if self.is_expired(now) => {
                Err(BookingError::CaptureWindowExpired {
                    booking_id: self.booking_id,
                    expired_at: self.authorization_expires_at,
                })
            },
            PaymentStatus::Authorized => Ok(CapturePlan::Capture {
                authorization_id: self.authorization_id()?,
                amount: self.authorized,
            }),
            PaymentStatus::Refunded | PaymentStatus::Failed => Err(BookingError::InvalidRequest(
                format!("payment for booking {} is {}; cannot capture", self.booking_id, self.status),
            )),
        }
    }

    /// Write a successful capture back.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::InvalidRequest`] if `amount` exceeds the
    /// authorization.
    pub fn record_capture(&mut self, capture_id: String, amount: Money) -> Result<(), BookingError> {
        if self.status == PaymentStatus::Captured || self.status == PaymentStatus::Refunded {
            return Ok(());
        }
        if amount > self.authorized {
            return Err(BookingError::InvalidRequest(format!(
                "capture of {amount} exceeds authorization of {}",
                self.authorized
            )));
        }
        self.capture_id = Some(capture_id);
        self.captured = amount;
        self.status = PaymentStatus::Captured;
        self.failure_reason = None;
        Ok(())
    }

    /// Decide what a refund of `amount` (everything refundable if `None`)
    /// requested under `token` should do.
    ///
    /// # Errors
    ///
    /// - [`BookingError::RefundExceedsCaptured`] if `amount > captured − refunded`
    /// - [`BookingError::InvalidRequest`] for zero amounts, failed records and
    ///   partial refunds of an uncaptured authorization
    pub fn plan_refund(&self, amount: Option<Money>, token: &RefundToken) -> Result<RefundPlan, BookingError> {
        match self.refund_for(token) {
            // Reserved earlier but never confirmed: send it again under the same key.
            Some(entry) if entry.pending => {
                return Ok(RefundPlan::Refund {
                    capture_id: self.capture_id()?,
                    amount: entry.amount,
                });
            },
            Some(_) => return Ok(RefundPlan::Replay),
            None => {},
        }
        if amount.is_some_and(|a| a.is_zero()) {
            return Err(BookingError::InvalidRequest("refund amount must be positive".to_string()));
        }
        if amount.is_none() && self.status == PaymentStatus::Refunded && self.captured.is_zero() {
            return Ok(RefundPlan::NothingHeld);
        }

        match self.status {
            PaymentStatus::Failed => Err(BookingError::InvalidRequest(format!(
                "payment for booking {} failed; nothing to refund",
                self.booking_id
            ))),
            PaymentStatus::Authorized => match amount {
                None => Ok(RefundPlan::Void {
                    authorization_id: self.authorization_id()?,
                }),
                Some(a) if a == self.authorized => Ok(RefundPlan::Void {
                    authorization_id: self.authorization_id()?,
                }),
                Some(a) if a > self.authorized => Err(BookingError::RefundExceedsCaptured {
                    requested: a,
                    refundable: self.authorized,
                }),
                Some(_) => Err(BookingError::InvalidRequest(
                    "partial refund requires a captured payment".to_string(),
                )),
            },
            PaymentStatus::Captured | PaymentStatus::Refunded => {
                let refundable = self.refundable();
                let amount = amount.unwrap_or(refundable);
                if amount > refundable || amount.is_zero() {
                    return Err(BookingError::RefundExceedsCaptured {
                        requested: amount,
                        refundable,
                    });
                }
                Ok(RefundPlan::Refund {
                    capture_id: self.capture_id()?,
                    amount,
                })
            },
        }
    }

    fn capture_id(&self) -> Result<String, BookingError> {
        self.capture_id.clone().ok_or_else(|| {
            BookingError::InvalidRequest(format!("booking {} has no capture on file", self.booking_id))
        })
    }

    /// Plan a refund and, if it goes to the provider, hold its amount back
    /// under `token` until [`PaymentRecord::record_refund`] or
    /// [`PaymentRecord::release_refund`].
    ///
    /// Stored under the record's version check, the reservation is what makes
    /// a second request see the reduced balance.
    ///
    /// # Errors
    ///
    /// Same as [`PaymentRecord::plan_refund`].
    pub fn reserve_refund(
        &mut self,
        amount: Option<Money>,
        token: &RefundToken,
        at: DateTime<Utc>,
    ) -> Result<RefundPlan, BookingError> {
        let plan = self.plan_refund(amount, token)?;
        if let RefundPlan::Refund { amount, .. } = &plan {
            if self.refund_for(token).is_none() {
                self.refunds.push(RefundEntry {
                    token: token.clone(),
                    refund_id: None,
                    amount: *amount,
                    at,
                    pending: true,
                });
            }
        }
        Ok(plan)
    }

    /// Drop the reservation under `token` after the provider refused it.
    pub fn release_refund(&mut self, token: &RefundToken) {
        self.refunds
            .retain(|entry| !(entry.pending && &entry.token == token));
    }

    /// Write a successful refund back, settling the reservation under `token`
    /// if there is one.
    ///
    /// A refund the provider already reported by webhook is not counted
    /// twice; its entry takes over `token` so a retry replays.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::RefundExceedsCaptured`] if applying it would
    /// refund more than was captured.
    pub fn record_refund(
        &mut self,
        token: RefundToken,
        refund_id: String,
        amount: Money,
        at: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        if self
            .refunds
            .iter()
            .any(|entry| entry.refund_id.as_deref() == Some(refund_id.as_str()))
        {
            self.release_refund(&token);
            if self.refund_for(&token).is_none() {
                if let Some(entry) = self.refunds.iter_mut().find(|entry| {
                    entry.refund_id.as_deref() == Some(refund_id.as_str()) && entry.token.is_provider()
                }) {
                    entry.token = token;
                }
            }
            return Ok(());
        }
        if self.refund_for(&token).is_some_and(|entry| !entry.pending) {
            return Ok(());
        }

        let unrefunded = self.unrefunded();
        if amount > unrefunded {
            return Err(BookingError::RefundExceedsCaptured {
                requested: amount,
                refundable: unrefunded,
            });
        }
        self.refunded = self
            .refunded
            .checked_add(amount)
            .ok_or_else(|| BookingError::InvalidRequest("refund overflow".to_string()))?;
        self.release_refund(&token);
        self.refunds.push(RefundEntry {
            token,
            refund_id: Some(refund_id),
            amount,
            at,
            pending: false,
        });
        if self.refunded == self.captured {
            self.status = PaymentStatus::Refunded;
        }
        Ok(())
    }

    /// Write a released authorization back. Nothing was captured, so nothing
    /// was refunded either.
    pub fn record_void(&mut self, token: Option<RefundToken>, at: DateTime<Utc>) {
        if self.status != PaymentStatus::Authorized {
            return;
        }
        self.status = PaymentStatus::Refunded;
        if let Some(token) = token {
            self.refunds.push(RefundEntry {
                token,
                refund_id: None,
                amount: Money::ZERO,
                at,
                pending: false,
            });
        }
    }

    /// Mark the authorization as failed (declined later, lapsed).
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        if self.status == PaymentStatus::Authorized {
            self.status = PaymentStatus::Failed;
        }
        self.failure_reason = Some(reason.into());
    }

    /// Apply one provider notification.
    ///
    /// Duplicates (by event id) and stale events (sequence not newer than the
    /// last applied one) change nothing. Applied events only move the status
    /// forward.
    pub fn apply_webhook(&mut self, event: &WebhookEvent) -> WebhookOutcome {
        if self.processed_events.contains(&event.event_id) {
            return WebhookOutcome::Duplicate;
        }
        if self
            .last_event_sequence
            .is_some_and(|last| event.sequence <= last)
        {
            self.processed_events.insert(event.event_id.clone());
            return WebhookOutcome::Stale;
        }

        let outcome = match &event.kind {
            WebhookEventKind::AuthorizationSucceeded => WebhookOutcome::Applied { changed: false },
            WebhookEventKind::AuthorizationFailed { reason } => {
                if self.is_live_authorization() {
                    self.record_failure(reason.clone());
                    WebhookOutcome::Applied { changed: true }
                } else {
                    WebhookOutcome::Applied { changed: false }
                }
            },
            WebhookEventKind::AuthorizationExpired => {
                if self.is_live_authorization() {
                    self.record_failure("authorization_expired");
                    WebhookOutcome::Applied { changed: true }
                } else {
                    WebhookOutcome::Applied { changed: false }
                }
            },
            WebhookEventKind::CaptureSucceeded { capture_id, amount } => {
                if self.advances_to(PaymentStatus::Captured) {
                    match self.record_capture(capture_id.clone(), *amount) {
                        Ok(()) => WebhookOutcome::Applied { changed: true },
                        Err(e) => WebhookOutcome::Ignored { reason: e.to_string() },
                    }
                } else {
                    WebhookOutcome::Applied { changed: false }
                }
            },
            WebhookEventKind::CaptureFailed { reason } => {
                if self.status == PaymentStatus::Authorized {
                    self.failure_reason = Some(reason.clone());
                    WebhookOutcome::Applied { changed: true }
                } else {
                    WebhookOutcome::Applied { changed: false }
                }
            },
            WebhookEventKind::RefundSucceeded { refund_id, amount } => {
                if self.status == PaymentStatus::Authorized {
                    // Provider released the hold without a capture.
                    self.record_void(None, event.occurred_at);
                    WebhookOutcome::Applied { changed: true }
                } else if self.captured.is_zero() {
                    WebhookOutcome::Applied { changed: false }
                } else {
                    let before = self.refunded;
                    let amount = (*amount).min(self.unrefunded());
                    match self.record_refund(
                        RefundToken::for_provider(refund_id),
                        refund_id.clone(),
                        amount,
                        event.occurred_at,
                    ) {
                        Ok(()) => WebhookOutcome::Applied {
                            changed: self.refunded != before,
                        },
                        Err(e) => WebhookOutcome::Ignored { reason: e.to_string() },
                    }
                }
            },
        };

        self.processed_events.insert(event.event_id.clone());
        self.last_event_sequence = Some(event.sequence);
        outcome
    }

    /// Whether moving to `target` would be forward progress
    fn advances_to(&self, target: PaymentStatus) -> bool {
        match (self.status.rank(), target.rank()) {
            (Some(current), Some(next)) => next > current,
            // A capture reported after we marked the hold failed still moved money.
            (None, Some(_)) => self.authorization_id.is_some(),
            _ => false,
        }
    }
}

// ============================================================================
// Provider notifications
// ============================================================================

/// What the provider is telling us.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookEventKind {
    /// Hold placed
    #[serde(rename = "authorization.succeeded")]
    AuthorizationSucceeded,
    /// Hold rejected after the fact
    #[serde(rename = "authorization.failed")]
    AuthorizationFailed {
        /// Provider's reason
        reason: String,
    },
    /// Hold lapsed
    #[serde(rename = "authorization.expired")]
    AuthorizationExpired,
    /// Funds taken
    #[serde(rename = "capture.succeeded")]
    CaptureSucceeded {
        /// Provider capture id
        capture_id: String,
        /// Amount taken
        amount: Money,
    },
    /// Capture attempt failed
    #[serde(rename = "capture.failed")]
    CaptureFailed {
        /// Provider's reason
        reason: String,
    },
    /// Funds returned
    #[serde(rename = "refund.succeeded")]
    RefundSucceeded {
        /// Provider refund id
        refund_id: String,
        /// Amount returned
        amount: Money,
    },
}

/// One provider notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Provider's unique event id
    pub event_id: String,
    /// Provider's monotonically increasing sequence for this authorization
    pub sequence: u64,
    /// Authorization the event is about
    pub authorization_id: String,
    /// When it happened at the provider
    pub occurred_at: DateTime<Utc>,
    /// What happened
    #[serde(flatten)]
    pub kind: WebhookEventKind,
}

/// Result of applying a notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Accepted; `changed` says whether the record moved
    Applied {
        /// Record changed
        changed: bool,
    },
    /// Event id seen before
    Duplicate,
    /// Sequence not newer than the last applied event
    Stale,
    /// Acknowledged without effect
    Ignored {
        /// Why
        reason: String,
    },
}
