//! JSON/HTTP surface over [`BookingService`].
//!
//! All routes live under `/api/v1` except `/health`:
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | POST | `/bookings` | create booking |
//! | GET | `/bookings/:id` | get booking |
//! | GET | `/bookings/:id/payment` | get payment record |
//! | POST | `/bookings/:id/transitions` | transition |
//! | POST | `/bookings/:id/refunds` | request refund |
//! | POST | `/bookings/:id/disputes` | open dispute |
//! | GET | `/disputes/:id` | get dispute |
//! | POST | `/disputes/:id/responses` | respond |
//! | POST | `/disputes/:id/resolution` | resolve |
//! | POST | `/webhooks/payments` | provider webhook |

pub mod error;
pub mod handlers;

pub use error::ApiError;

use crate::coordinator::BookingService;
use crate::webhook::WebhookVerifier;
use axum::{
    Router,
    extract::FromRef,
    routing::{get, post},
};
use skymarket_core::environment::Clock;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across all HTTP handlers.
///
/// Cloned for each request; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// The booking lifecycle manager
    pub service: BookingService,
    /// Webhook signature verification
    pub webhooks: Arc<WebhookVerifier>,
    /// Clock for webhook timestamp checks
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(service: BookingService, webhooks: WebhookVerifier, clock: Arc<dyn Clock>) -> Self {
        Self {
            service,
            webhooks: Arc::new(webhooks),
            clock,
        }
    }
}

impl FromRef<AppState> for BookingService {
    fn from_ref(state: &AppState) -> Self {
        state.service.clone()
    }
}

/// Build the complete Axum router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/bookings", post(handlers::create_booking))
        .route("/bookings/:id", get(handlers::get_booking))
        .route("/bookings/:id/payment", get(handlers::get_payment))
        .route("/bookings/:id/transitions", post(handlers::transition_booking))
        .route("/bookings/:id/refunds", post(handlers::request_refund))
        .route("/bookings/:id/disputes", post(handlers::open_dispute))
        .route("/disputes/:id", get(handlers::get_dispute))
        .route("/disputes/:id/responses", post(handlers::respond_to_dispute))
        .route("/disputes/:id/resolution", post(handlers::resolve_dispute))
        .route("/webhooks/payments", post(handlers::payment_webhook));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
