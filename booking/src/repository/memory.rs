//! In-memory repository for development and tests.

use super::{BookingRepository, RepoFuture, RepositoryError};
use crate::booking::Booking;
use crate::dispute::Dispute;
use crate::payment::{PaymentRecord, PaymentStatus};
use crate::types::{BookingId, DisputeId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local storage guarded by async read-write locks.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    bookings: RwLock<HashMap<BookingId, Booking>>,
    payments: RwLock<HashMap<BookingId, PaymentRecord>>,
    disputes: RwLock<HashMap<DisputeId, Dispute>>,
}

impl InMemoryRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Compare-and-swap on a versioned entry.
fn check_version(
    entity: &'static str,
    id: String,
    stored: Option<u64>,
    expected: u64,
) -> Result<u64, RepositoryError> {
    match stored {
        None => Err(RepositoryError::NotFound { entity, id }),
        Some(current) if current != expected => {
            Err(RepositoryError::ConcurrentModification { entity, id })
        },
        Some(current) => Ok(current + 1),
    }
}

impl BookingRepository for InMemoryRepository {
    fn insert_booking(&self, mut booking: Booking) -> RepoFuture<'_, Booking> {
        Box::pin(async move {
            let mut bookings = self.bookings.write().await;
            if bookings.contains_key(&booking.id) {
                return Err(RepositoryError::Duplicate {
                    entity: "booking",
                    id: booking.id.to_string(),
                });
            }
            booking.version = 1;
            bookings.insert(booking.id, booking.clone());
            Ok(booking)
        })
    }

    fn load_booking(&self, id: BookingId) -> RepoFuture<'_, Option<Booking>> {
        Box::pin(async move { Ok(self.bookings.read().await.get(&id).cloned()) })
    }

    fn save_booking(&self, mut booking: Booking) -> RepoFuture<'_, Booking> {
        Box::pin(async move {
            let mut bookings = self.bookings.write().await;
            booking.version = check_version(
                "booking",
                booking.id.to_string(),
                bookings.get(&booking.id).map(|b| b.version),
                booking.version,
            )?;
            bookings.insert(booking.id, booking.clone());
            Ok(booking)
        })
    }

    fn insert_payment(&self, mut record: PaymentRecord) -> RepoFuture<'_, PaymentRecord> {
        Box::pin(async move {
            let mut payments = self.payments.write().await;
            if payments.contains_key(&record.booking_id) {
                return Err(RepositoryError::Duplicate {
                    entity: "payment_record",
                    id: record.booking_id.to_string(),
                });
            }
            record.version = 1;
            payments.insert(record.booking_id, record.clone());
            Ok(record)
        })
    }

    fn load_payment(&self, booking_id: BookingId) -> RepoFuture<'_, Option<PaymentRecord>> {
        Box::pin(async move { Ok(self.payments.read().await.get(&booking_id).cloned()) })
    }

    fn save_payment(&self, mut record: PaymentRecord) -> RepoFuture<'_, PaymentRecord> {
        Box::pin(async move {
            let mut payments = self.payments.write().await;
            record.version = check_version(
                "payment_record",
                record.booking_id.to_string(),
                payments.get(&record.booking_id).map(|p| p.version),
                record.version,
            )?;
            payments.insert(record.booking_id, record.clone());
            Ok(record)
        })
    }

    fn find_payment_by_authorization(
        &self,
        authorization_id: String,
    ) -> RepoFuture<'_, Option<PaymentRecord>> {
        Box::pin(async move {
            Ok(self
                .payments
                .read()
                .await
                .values()
                .find(|p| p.authorization_id.as_deref() == Some(authorization_id.as_str()))
                .cloned())
        })
    }

    fn list_expiring_authorizations(&self, cutoff: DateTime<Utc>) -> RepoFuture<'_, Vec<PaymentRecord>> {
        Box::pin(async move {
            let mut expiring: Vec<_> = self
                .payments
                .read()
                .await
                .values()
                .filter(|p| p.status == PaymentStatus::Authorized && p.authorization_expires_at <= cutoff)
                .cloned()
                .collect();
            expiring.sort_by_key(|p| p.authorization_expires_at);
            Ok(expiring)
        })
    }

    fn insert_dispute(&self, mut dispute: Dispute) -> RepoFuture<'_, Dispute> {
        Box::pin(async move {
            let mut disputes = self.disputes.write().await;
            if disputes.contains_key(&dispute.id)
                || disputes.values().any(|d| d.booking_id == dispute.booking_id)
            {
                return Err(RepositoryError::Duplicate {
                    entity: "dispute",
                    id: dispute.booking_id.to_string(),
                });
            }
            dispute.version = 1;
            disputes.insert(dispute.id, dispute.clone());
            Ok(dispute)
        })
    }

    fn load_dispute(&self, id: DisputeId) -> RepoFuture<'_, Option<Dispute>> {
        Box::pin(async move { Ok(self.disputes.read().await.get(&id).cloned()) })
    }

    fn find_dispute_for_booking(&self, booking_id: BookingId) -> RepoFuture<'_, Option<Dispute>> {
        Box::pin(async move {
            Ok(self
                .disputes
                .read()
                .await
                .values()
                .find(|d| d.booking_id == booking_id)
                .cloned())
        })
    }

    fn save_dispute(&self, mut dispute: Dispute) -> RepoFuture<'_, Dispute> {
        Box::pin(async move {
            let mut disputes = self.disputes.write().await;
            dispute.version = check_version(
                "dispute",
                dispute.id.to_string(),
                disputes.get(&dispute.id).map(|d| d.version),
                dispute.version,
            )?;
            disputes.insert(dispute.id, dispute.clone());
            Ok(dispute)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::Money;
    use chrono::Duration;
    use skymarket_testing::epoch;

    fn record(booking_id: BookingId, expires_in_days: i64) -> PaymentRecord {
        PaymentRecord::authorized(
            booking_id,
            format!("auth_{booking_id}"),
            Money::from_cents(4250),
            epoch(),
            epoch() + Duration::days(expires_in_days),
        )
    }

    #[tokio::test]
    async fn test_stale_save_is_rejected() {
        let repo = InMemoryRepository::new();
        let stored = repo.insert_payment(record(BookingId::new(), 7)).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut first = stored.clone();
        first.failure_reason = Some("first".to_string());
        let mut second = stored;
        second.failure_reason = Some("second".to_string());

        let saved = repo.save_payment(first).await.unwrap();
        assert_eq!(saved.version, 2);
        assert!(matches!(
            repo.save_payment(second).await,
            Err(RepositoryError::ConcurrentModification { .. })
        ));

        let loaded = repo.load_payment(saved.booking_id).await.unwrap().unwrap();
        assert_eq!(loaded.failure_reason.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_duplicate_payment_insert_is_rejected() {
        let repo = InMemoryRepository::new();
        let booking_id = BookingId::new();
        repo.insert_payment(record(booking_id, 7)).await.unwrap();
        assert!(matches!(
            repo.insert_payment(record(booking_id, 7)).await,
            Err(RepositoryError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn test_lookup_by_authorization_and_expiry() {
        let repo = InMemoryRepository::new();
        let soon = repo.insert_payment(record(BookingId::new(), 1)).await.unwrap();
        let later = repo.insert_payment(record(BookingId::new(), 30)).await.unwrap();

        let found = repo
            .find_payment_by_authorization(later.authorization_id.clone().unwrap())
            .await
            .unwrap();
        assert_eq!(found.map(|p| p.booking_id), Some(later.booking_id));

        let expiring = repo
            .list_expiring_authorizations(epoch() + Duration::days(7))
            .await
            .unwrap();
        assert_eq!(
            expiring.iter().map(|p| p.booking_id).collect::<Vec<_>>(),
            vec![soon.booking_id]
        );
    }
}
