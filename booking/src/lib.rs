//! SkyMarket booking lifecycle manager.
//!
//! Drives a drone-service booking from request to payout:
//!
//! - **Geo validation**: pickup and service points must lie inside the
//!   operating region; distances are great-circle miles
//! - **Pricing**: quotes are recomputed from the rate card and must match
//! - **Lifecycle**: a status graph with role-based permissions, an ordered
//!   history and an idempotent retry path
//! - **Payments**: authorize on creation, capture on completion, void or
//!   refund on cancellation, all keyed so that retries never move money twice
//! - **Disputes**: a time-boxed dispute window with arbitrated resolutions
//!
//! # Architecture
//!
//! ```text
//!  HTTP (axum) ──▶ BookingService ◀── provider webhooks (HMAC verified)
//!                        │
//!        ┌───────────────┼────────────────────┐
//!        ▼               ▼                    ▼
//!  BookingReducer   DisputeReducer   PaymentCoordinator ──▶ PaymentGateway
//!        │               │                    │
//!        └───────────────┴────────────────────┘
//!                        │
//!                        ▼
//!               BookingRepository
//!           (in-memory / PostgreSQL)
//! ```
//!
//! Reducers are pure: they validate a command against the current state,
//! mutate it and return notification effects. [`BookingService`] loads state,
//! runs the reducer, moves money through the gateway and stores the result
//! under an optimistic version check.
//!
//! # Usage
//!
//! See [`coordinator::BookingService`] for the operations and
//! [`api::router`] for the HTTP surface.

#![forbid(unsafe_code)]

pub mod api;
pub mod booking;
pub mod config;
pub mod coordinator;
pub mod dispute;
pub mod error;
pub mod gateway;
pub mod geo;
pub mod lifecycle;
pub mod notifier;
pub mod payment;
pub mod pricing;
pub mod repository;
pub mod types;
pub mod webhook;

pub use booking::{Booking, BookingEnvironment, BookingRequest, CancellationReason};
pub use config::Config;
pub use coordinator::{BookingService, PaymentCoordinator, PaymentSettings, SweepReport};
pub use dispute::{Dispute, DisputeReason, DisputeStatus, Resolution};
pub use error::{BookingError, Result};
pub use gateway::{MockPaymentGateway, PaymentGateway};
pub use lifecycle::BookingStatus;
pub use payment::{PaymentRecord, PaymentStatus, RefundToken};
pub use repository::{BookingRepository, InMemoryRepository};
pub use types::{Actor, BookingId, Coordinates, DisputeId, Money, PartyId};
