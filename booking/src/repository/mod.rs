//! Persistence of bookings, payment records and disputes.
//!
//! Every write is versioned. `insert_*` stores a new entity at version 1;
//! `save_*` takes the entity as it was loaded, checks that the stored version
//! still matches, and stores it at `version + 1`. A mismatch is
//! [`RepositoryError::ConcurrentModification`]: the caller lost a race and must
//! re-read before retrying.

use crate::booking::Booking;
use crate::dispute::Dispute;
use crate::error::BookingError;
use crate::payment::PaymentRecord;
use crate::types::{BookingId, DisputeId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::InMemoryRepository;
#[cfg(feature = "postgres")]
pub use postgres::PostgresRepository;

/// Repository errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// Stored version differs from the expected one
    #[error("{entity} {id} was modified concurrently")]
    ConcurrentModification {
        /// Entity kind
        entity: &'static str,
        /// Entity id
        id: String,
    },
    /// Entity does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Entity id
        id: String,
    },
    /// Entity already exists
    #[error("{entity} {id} already exists")]
    Duplicate {
        /// Entity kind
        entity: &'static str,
        /// Entity id
        id: String,
    },
    /// Database failure
    #[error("database error: {0}")]
    Database(String),
    /// Row could not be mapped to or from the domain type
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<RepositoryError> for BookingError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::ConcurrentModification { entity, id } => {
                Self::ConcurrentModification { entity, id }
            },
            RepositoryError::NotFound { entity, id } => Self::NotFound { entity, id },
            // A duplicate dispute insert means another request opened it first.
            RepositoryError::Duplicate { entity, id } => Self::ConcurrentModification { entity, id },
            RepositoryError::Database(message) | RepositoryError::Serialization(message) => {
                tracing::error!(error = %message, "repository failure");
                Self::Storage(message)
            },
        }
    }
}

/// Boxed future returned by repository calls
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// Storage for the three booking-lifecycle entities.
pub trait BookingRepository: Send + Sync {
    /// Store a new booking at version 1
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Duplicate`] if the id is taken
    fn insert_booking(&self, booking: Booking) -> RepoFuture<'_, Booking>;

    /// Load a booking
    ///
    /// # Errors
    ///
    /// Returns error on storage failure
    fn load_booking(&self, id: BookingId) -> RepoFuture<'_, Option<Booking>>;

    /// Store `booking` if its version is still current
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ConcurrentModification`] on a stale version
    fn save_booking(&self, booking: Booking) -> RepoFuture<'_, Booking>;

    /// Store a new payment record at version 1
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Duplicate`] if the booking already has one
    fn insert_payment(&self, record: PaymentRecord) -> RepoFuture<'_, PaymentRecord>;

    /// Load the payment record of a booking
    ///
    /// # Errors
    ///
    /// Returns error on storage failure
    fn load_payment(&self, booking_id: BookingId) -> RepoFuture<'_, Option<PaymentRecord>>;

    /// Store `record` if its version is still current
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ConcurrentModification`] on a stale version
    fn save_payment(&self, record: PaymentRecord) -> RepoFuture<'_, PaymentRecord>;

    /// Find the payment record holding `authorization_id`
    ///
    /// # Errors
    ///
    /// Returns error on storage failure
    fn find_payment_by_authorization(
        &self,
        authorization_id: String,
    ) -> RepoFuture<'_, Option<PaymentRecord>>;

    /// Live authorizations whose hold lapses at or before `cutoff`
    ///
    /// # Errors
    ///
    /// Returns error on storage failure
    fn list_expiring_authorizations(&self, cutoff: DateTime<Utc>) -> RepoFuture<'_, Vec<PaymentRecord>>;

    /// Store a new dispute at version 1
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Duplicate`] if the booking already has a dispute
    fn insert_dispute(&self, dispute: Dispute) -> RepoFuture<'_, Dispute>;

    /// Load a dispute
    ///
    /// # Errors
    ///
    /// Returns error on storage failure
    fn load_dispute(&self, id: DisputeId) -> RepoFuture<'_, Option<Dispute>>;

    /// The dispute of a booking, if any
    ///
    /// # Errors
    ///
    /// Returns error on storage failure
    fn find_dispute_for_booking(&self, booking_id: BookingId) -> RepoFuture<'_, Option<Dispute>>;

    /// Store `dispute` if its version is still current
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ConcurrentModification`] on a stale version
    fn save_dispute(&self, dispute: Dispute) -> RepoFuture<'_, Dispute>;
}
