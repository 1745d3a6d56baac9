//! Request handlers.
//!
//! Handlers only translate between JSON and [`BookingService`] calls. There is
//! no authentication layer here: the acting party travels in the body and the
//! core checks what that party may do.

use super::AppState;
use super::error::ApiError;
use crate::booking::{Booking, BookingRequest};
use crate::coordinator::BookingService;
use crate::dispute::{Dispute, DisputeReason, Resolution};
use crate::lifecycle::BookingStatus;
use crate::payment::{PaymentRecord, RefundToken, WebhookOutcome};
use crate::types::{Actor, BookingId, DisputeId, Money};
use crate::webhook::SIGNATURE_HEADER;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Body of `POST /bookings/:id/transitions`
#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    /// Requested status
    pub status: BookingStatus,
    /// Who asks
    pub actor: Actor,
}

/// Body of `POST /bookings/:id/refunds`
#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    /// Amount in cents; everything refundable if omitted
    pub amount: Option<Money>,
    /// Client idempotency token
    pub token: String,
    /// Who asks
    pub actor: Actor,
}

/// Body of `POST /bookings/:id/disputes`
#[derive(Debug, Deserialize)]
pub struct OpenDisputeRequest {
    /// Who opens it (must be the requester)
    pub initiator: Actor,
    /// Why
    pub reason: DisputeReason,
    /// Details
    pub description: String,
}

/// Body of `POST /disputes/:id/responses`
#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    /// Who answers
    pub responder: Actor,
    /// Message
    pub message: String,
}

/// Body of `POST /disputes/:id/resolution`
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// Decision
    pub resolution: Resolution,
    /// Required for `partial_refund`
    pub refund_amount: Option<Money>,
    /// Arbitrator
    pub actor: Actor,
}

/// Webhook acknowledgement.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    /// Always `true`: the delivery was received
    pub received: bool,
    /// What happened, when the event was applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WebhookOutcome>,
    /// Why the delivery was dropped, when it was
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: &'static str,
    /// Service version
    pub version: &'static str,
}

// ============================================================================
// Bookings
// ============================================================================

/// `POST /bookings`
pub async fn create_booking(
    State(service): State<BookingService>,
    Json(request): Json<BookingRequest>,
) -> ApiResult<(StatusCode, Json<Booking>)> {
    let booking = service.create_booking(request).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// `GET /bookings/:id`
pub async fn get_booking(
    State(service): State<BookingService>,
    Path(booking_id): Path<BookingId>,
) -> ApiResult<Json<Booking>> {
    Ok(Json(service.booking(booking_id).await?))
}

/// `GET /bookings/:id/payment`
pub async fn get_payment(
    State(service): State<BookingService>,
    Path(booking_id): Path<BookingId>,
) -> ApiResult<Json<PaymentRecord>> {
    Ok(Json(service.payment(booking_id).await?))
}

/// `POST /bookings/:id/transitions`
pub async fn transition_booking(
    State(service): State<BookingService>,
    Path(booking_id): Path<BookingId>,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<Json<Booking>> {
    let booking = service
        .transition(booking_id, request.status, request.actor)
        .await?;
    Ok(Json(booking))
}

/// `POST /bookings/:id/refunds`
pub async fn request_refund(
    State(service): State<BookingService>,
    Path(booking_id): Path<BookingId>,
    Json(request): Json<RefundRequest>,
) -> ApiResult<Json<PaymentRecord>> {
    if request.token.trim().is_empty() {
        return Err(ApiError::bad_request("refund token must not be empty"));
    }
    let record = service
        .request_refund(
            booking_id,
            request.amount,
            RefundToken::new(request.token),
            request.actor,
        )
        .await?;
    Ok(Json(record))
}

// ============================================================================
// Disputes
// ============================================================================

/// `POST /bookings/:id/disputes`
pub async fn open_dispute(
    State(service): State<BookingService>,
    Path(booking_id): Path<BookingId>,
    Json(request): Json<OpenDisputeRequest>,
) -> ApiResult<(StatusCode, Json<Dispute>)> {
    let dispute = service
        .open_dispute(booking_id, request.initiator, request.reason, request.description)
        .await?;
    Ok((StatusCode::CREATED, Json(dispute)))
}

/// `GET /disputes/:id`
pub async fn get_dispute(
    State(service): State<BookingService>,
    Path(dispute_id): Path<DisputeId>,
) -> ApiResult<Json<Dispute>> {
    Ok(Json(service.dispute(dispute_id).await?))
}

/// `POST /disputes/:id/responses`
pub async fn respond_to_dispute(
    State(service): State<BookingService>,
    Path(dispute_id): Path<DisputeId>,
    Json(request): Json<RespondRequest>,
) -> ApiResult<Json<Dispute>> {
    let dispute = service
        .respond(dispute_id, request.responder, request.message)
        .await?;
    Ok(Json(dispute))
}

/// `POST /disputes/:id/resolution`
pub async fn resolve_dispute(
    State(service): State<BookingService>,
    Path(dispute_id): Path<DisputeId>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<Json<Dispute>> {
    let dispute = service
        .resolve(dispute_id, request.resolution, request.refund_amount, request.actor)
        .await?;
    Ok(Json(dispute))
}

// ============================================================================
// Provider webhooks
// ============================================================================

/// `POST /webhooks/payments`
///
/// Bad signatures, malformed bodies and unknown authorizations are logged and
/// acknowledged with 200 so the provider stops redelivering them. Only a
/// storage failure answers 5xx, asking for a redelivery.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        tracing::warn!("webhook without signature header");
        return Ok(Json(WebhookAck::rejected("missing signature")));
    };

    let event = match state.webhooks.verify(signature, &body, state.clock.now()) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "webhook rejected");
            return Ok(Json(WebhookAck::rejected(e.to_string())));
        },
    };

    match state.service.apply_webhook(&event).await {
        Ok(outcome) => Ok(Json(WebhookAck {
            received: true,
            outcome: Some(outcome),
            rejected: None,
        })),
        Err(e) if e.is_retryable() || matches!(e, crate::error::BookingError::Storage(_)) => {
            Err(e.into())
        },
        Err(e) => {
            tracing::warn!(event_id = %event.event_id, error = %e, "webhook could not be applied");
            Ok(Json(WebhookAck::rejected(e.to_string())))
        },
    }
}

impl WebhookAck {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            received: true,
            outcome: None,
            rejected: Some(reason.into()),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// `GET /health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
