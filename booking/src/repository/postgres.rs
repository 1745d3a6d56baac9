//! `PostgreSQL` repository.
//!
//! Plain `sqlx` runtime queries (no compile-time checking, so building does not
//! need a database). Optimistic concurrency is an `UPDATE … WHERE version = $n`;
//! zero affected rows means the row is missing or was changed underneath us.

use super::{BookingRepository, RepoFuture, RepositoryError};
use crate::booking::{Booking, CancellationReason};
use crate::dispute::{Dispute, DisputeDecision, DisputeReason, DisputeResponse, DisputeStatus};
use crate::lifecycle::BookingStatus;
use crate::payment::{PaymentRecord, PaymentStatus, RefundEntry};
use crate::types::{
    BookingId, Coordinates, DisputeId, Locations, Money, PartyId, Schedule, ServiceId,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Schema applied by [`PostgresRepository::migrate`].
const MIGRATION: &str = include_str!("../../migrations/0001_booking_lifecycle.sql");

/// Repository backed by a `PostgreSQL` connection pool.
#[derive(Clone, Debug)]
pub struct PostgresRepository {
    pool: PgPool,
}

fn db(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Database(e.to_string())
}

fn ser(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Serialization(e.to_string())
}

fn to_i64(value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(ser)
}

fn to_u64(value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(ser)
}

fn money(cents: i64) -> Result<Money, RepositoryError> {
    to_u64(cents).map(Money::from_cents)
}

impl PostgresRepository {
    /// Connect with a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(MIGRATION).execute(&self.pool).await.map_err(db)?;
        Ok(())
    }

    /// Distinguish a missing row from a stale version after an update hit nothing.
    async fn missing_or_stale(
        &self,
        exists_sql: &'static str,
        key: Uuid,
        entity: &'static str,
    ) -> RepositoryError {
        match sqlx::query(exists_sql).bind(key).fetch_optional(&self.pool).await {
            Ok(Some(_)) => RepositoryError::ConcurrentModification {
                entity,
                id: key.to_string(),
            },
            Ok(None) => RepositoryError::NotFound {
                entity,
                id: key.to_string(),
            },
            Err(e) => db(e),
        }
    }

    fn row_to_booking(row: &PgRow) -> Result<Booking, RepositoryError> {
        let status: String = row.try_get("status").map_err(db)?;
        let cancellation_reason: Option<String> = row.try_get("cancellation_reason").map_err(db)?;
        let duration_minutes: i32 = row.try_get("duration_minutes").map_err(db)?;

        Ok(Booking {
            id: BookingId::from_uuid(row.try_get("id").map_err(db)?),
            status: status.parse::<BookingStatus>().map_err(ser)?,
            requester: PartyId::from_uuid(row.try_get("requester_id").map_err(db)?),
            provider: PartyId::from_uuid(row.try_get("provider_id").map_err(db)?),
            service: ServiceId::from_uuid(row.try_get("service_id").map_err(db)?),
            schedule: Schedule {
                starts_at: row.try_get("starts_at").map_err(db)?,
                duration_minutes: u32::try_from(duration_minutes).map_err(ser)?,
            },
            locations: Locations {
                pickup: Coordinates::new(
                    row.try_get("pickup_latitude").map_err(db)?,
                    row.try_get("pickup_longitude").map_err(db)?,
                ),
                delivery: Coordinates::new(
                    row.try_get("delivery_latitude").map_err(db)?,
                    row.try_get("delivery_longitude").map_err(db)?,
                ),
            },
            quoted_amount: money(row.try_get("quoted_cents").map_err(db)?)?,
            payment_reference: row.try_get("payment_reference").map_err(db)?,
            cancellation_reason: cancellation_reason
                .map(|r| {
                    CancellationReason::parse(&r)
                        .ok_or_else(|| ser(format!("unknown cancellation reason: {r}")))
                })
                .transpose()?,
            created_at: row.try_get("created_at").map_err(db)?,
            accepted_at: row.try_get("accepted_at").map_err(db)?,
            started_at: row.try_get("started_at").map_err(db)?,
            completed_at: row.try_get("completed_at").map_err(db)?,
            disputed_at: row.try_get("disputed_at").map_err(db)?,
            resolved_at: row.try_get("resolved_at").map_err(db)?,
            cancelled_at: row.try_get("cancelled_at").map_err(db)?,
            refunded_at: row.try_get("refunded_at").map_err(db)?,
            version: to_u64(row.try_get("version").map_err(db)?)?,
        })
    }

    fn row_to_payment(row: &PgRow) -> Result<PaymentRecord, RepositoryError> {
        let status: String = row.try_get("status").map_err(db)?;
        let Json(refunds): Json<Vec<RefundEntry>> = row.try_get("refunds").map_err(db)?;
        let Json(processed_events): Json<BTreeSet<String>> =
            row.try_get("processed_events").map_err(db)?;
        let last_event_sequence: Option<i64> = row.try_get("last_event_sequence").map_err(db)?;

        Ok(PaymentRecord {
            booking_id: BookingId::from_uuid(row.try_get("booking_id").map_err(db)?),
            authorization_id: row.try_get("authorization_id").map_err(db)?,
            capture_id: row.try_get("capture_id").map_err(db)?,
            authorized: money(row.try_get("authorized_cents").map_err(db)?)?,
            captured: money(row.try_get("captured_cents").map_err(db)?)?,
            refunded: money(row.try_get("refunded_cents").map_err(db)?)?,
            status: PaymentStatus::parse(&status)
                .ok_or_else(|| ser(format!("unknown payment status: {status}")))?,
            authorized_at: row.try_get("authorized_at").map_err(db)?,
            authorization_expires_at: row.try_get("authorization_expires_at").map_err(db)?,
            failure_reason: row.try_get("failure_reason").map_err(db)?,
            refunds,
            processed_events,
            last_event_sequence: last_event_sequence.map(to_u64).transpose()?,
            version: to_u64(row.try_get("version").map_err(db)?)?,
        })
    }

    fn row_to_dispute(row: &PgRow) -> Result<Dispute, RepositoryError> {
        let reason: String = row.try_get("reason").map_err(db)?;
        let status: String = row.try_get("status").map_err(db)?;
        let decision: Option<Json<DisputeDecision>> = row.try_get("decision").map_err(db)?;
        let Json(responses): Json<Vec<DisputeResponse>> = row.try_get("responses").map_err(db)?;

        Ok(Dispute {
            id: DisputeId::from_uuid(row.try_get("id").map_err(db)?),
            booking_id: BookingId::from_uuid(row.try_get("booking_id").map_err(db)?),
            requester: PartyId::from_uuid(row.try_get("requester_id").map_err(db)?),
            provider: PartyId::from_uuid(row.try_get("provider_id").map_err(db)?),
            reason: DisputeReason::parse(&reason)
                .ok_or_else(|| ser(format!("unknown dispute reason: {reason}")))?,
            description: row.try_get("description").map_err(db)?,
            status: DisputeStatus::parse(&status)
                .ok_or_else(|| ser(format!("unknown dispute status: {status}")))?,
            decision: decision.map(|Json(d)| d),
            responses,
            opened_at: row.try_get("opened_at").map_err(db)?,
            resolved_at: row.try_get("resolved_at").map_err(db)?,
            version: to_u64(row.try_get("version").map_err(db)?)?,
        })
    }
}

const BOOKING_COLUMNS: &str = "id, status, requester_id, provider_id, service_id, starts_at, \
     duration_minutes, pickup_latitude, pickup_longitude, delivery_latitude, delivery_longitude, \
     quoted_cents, payment_reference, cancellation_reason, created_at, accepted_at, started_at, \
     completed_at, disputed_at, resolved_at, cancelled_at, refunded_at, version";

const PAYMENT_COLUMNS: &str = "booking_id, authorization_id, capture_id, authorized_cents, \
     captured_cents, refunded_cents, status, authorized_at, authorization_expires_at, \
     failure_reason, refunds, processed_events, last_event_sequence, version";

const DISPUTE_COLUMNS: &str = "id, booking_id, requester_id, provider_id, reason, description, \
     status, decision, responses, opened_at, resolved_at, version";

impl BookingRepository for PostgresRepository {
    fn insert_booking(&self, mut booking: Booking) -> RepoFuture<'_, Booking> {
        Box::pin(async move {
            booking.version = 1;
            let result = sqlx::query(
                r"
                INSERT INTO bookings (
                    id, status, requester_id, provider_id, service_id, starts_at,
                    duration_minutes, pickup_latitude, pickup_longitude,
                    delivery_latitude, delivery_longitude, quoted_cents,
                    payment_reference, cancellation_reason, created_at, accepted_at,
                    started_at, completed_at, disputed_at, resolved_at, cancelled_at,
                    refunded_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                        $15, $16, $17, $18, $19, $20, $21, $22, $23)
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(booking.id.as_uuid())
            .bind(booking.status.as_str())
            .bind(booking.requester.as_uuid())
            .bind(booking.provider.as_uuid())
            .bind(booking.service.as_uuid())
            .bind(booking.schedule.starts_at)
            .bind(i32::try_from(booking.schedule.duration_minutes).map_err(ser)?)
            .bind(booking.locations.pickup.latitude)
            .bind(booking.locations.pickup.longitude)
            .bind(booking.locations.delivery.latitude)
            .bind(booking.locations.delivery.longitude)
            .bind(to_i64(booking.quoted_amount.cents())?)
            .bind(booking.payment_reference.as_deref())
            .bind(booking.cancellation_reason.map(CancellationReason::as_str))
            .bind(booking.created_at)
            .bind(booking.accepted_at)
            .bind(booking.started_at)
            .bind(booking.completed_at)
            .bind(booking.disputed_at)
            .bind(booking.resolved_at)
            .bind(booking.cancelled_at)
            .bind(booking.refunded_at)
            .bind(to_i64(booking.version)?)
            .execute(&self.pool)
            .await
            .map_err(db)?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::Duplicate {
                    entity: "booking",
                    id: booking.id.to_string(),
                });
            }
            Ok(booking)
        })
    }

    fn load_booking(&self, id: BookingId) -> RepoFuture<'_, Option<Booking>> {
        Box::pin(async move {
            let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1");
            sqlx::query(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?
                .as_ref()
                .map(Self::row_to_booking)
                .transpose()
        })
    }

    fn save_booking(&self, mut booking: Booking) -> RepoFuture<'_, Booking> {
        Box::pin(async move {
            let expected = to_i64(booking.version)?;
            let result = sqlx::query(
                r"
                UPDATE bookings SET
                    status = $2, payment_reference = $3, cancellation_reason = $4,
                    accepted_at = $5, started_at = $6, completed_at = $7,
                    disputed_at = $8, resolved_at = $9, cancelled_at = $10,
                    refunded_at = $11, version = version + 1
                WHERE id = $1 AND version = $12
                ",
            )
            .bind(booking.id.as_uuid())
            .bind(booking.status.as_str())
            .bind(booking.payment_reference.as_deref())
            .bind(booking.cancellation_reason.map(CancellationReason::as_str))
            .bind(booking.accepted_at)
            .bind(booking.started_at)
            .bind(booking.completed_at)
            .bind(booking.disputed_at)
            .bind(booking.resolved_at)
            .bind(booking.cancelled_at)
            .bind(booking.refunded_at)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(db)?;

            if result.rows_affected() == 0 {
                return Err(self
                    .missing_or_stale("SELECT 1 FROM bookings WHERE id = $1", *booking.id.as_uuid(), "booking")
                    .await);
            }
            booking.version += 1;
            Ok(booking)
        })
    }

    fn insert_payment(&self, mut record: PaymentRecord) -> RepoFuture<'_, PaymentRecord> {
        Box::pin(async move {
            record.version = 1;
            let result = sqlx::query(
                r"
                INSERT INTO payment_records (
                    booking_id, authorization_id, capture_id, authorized_cents,
                    captured_cents, refunded_cents, status, authorized_at,
                    authorization_expires_at, failure_reason, refunds,
                    processed_events, last_event_sequence, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (booking_id) DO NOTHING
                ",
            )
            .bind(record.booking_id.as_uuid())
            .bind(record.authorization_id.as_deref())
            .bind(record.capture_id.as_deref())
            .bind(to_i64(record.authorized.cents())?)
            .bind(to_i64(record.captured.cents())?)
            .bind(to_i64(record.refunded.cents())?)
            .bind(record.status.as_str())
            .bind(record.authorized_at)
            .bind(record.authorization_expires_at)
            .bind(record.failure_reason.as_deref())
            .bind(Json(&record.refunds))
            .bind(Json(&record.processed_events))
            .bind(record.last_event_sequence.map(to_i64).transpose()?)
            .bind(to_i64(record.version)?)
            .execute(&self.pool)
            .await
            .map_err(db)?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::Duplicate {
                    entity: "payment_record",
                    id: record.booking_id.to_string(),
                });
            }
            Ok(record)
        })
    }

    fn load_payment(&self, booking_id: BookingId) -> RepoFuture<'_, Option<PaymentRecord>> {
        Box::pin(async move {
            let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE booking_id = $1");
            sqlx::query(&sql)
                .bind(booking_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?
                .as_ref()
                .map(Self::row_to_payment)
                .transpose()
        })
    }

    fn save_payment(&self, mut record: PaymentRecord) -> RepoFuture<'_, PaymentRecord> {
        Box::pin(async move {
            let expected = to_i64(record.version)?;
            let result = sqlx::query(
                r"
                UPDATE payment_records SET
                    authorization_id = $2, capture_id = $3, authorized_cents = $4,
                    captured_cents = $5, refunded_cents = $6, status = $7,
                    authorized_at = $8, authorization_expires_at = $9,
                    failure_reason = $10, refunds = $11, processed_events = $12,
                    last_event_sequence = $13, version = version + 1
                WHERE booking_id = $1 AND version = $14
                ",
            )
            .bind(record.booking_id.as_uuid())
            .bind(record.authorization_id.as_deref())
            .bind(record.capture_id.as_deref())
            .bind(to_i64(record.authorized.cents())?)
            .bind(to_i64(record.captured.cents())?)
            .bind(to_i64(record.refunded.cents())?)
            .bind(record.status.as_str())
            .bind(record.authorized_at)
            .bind(record.authorization_expires_at)
            .bind(record.failure_reason.as_deref())
            .bind(Json(&record.refunds))
            .bind(Json(&record.processed_events))
            .bind(record.last_event_sequence.map(to_i64).transpose()?)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(db)?;

            if result.rows_affected() == 0 {
                return Err(self
                    .missing_or_stale(
                        "SELECT 1 FROM payment_records WHERE booking_id = $1",
                        *record.booking_id.as_uuid(),
                        "payment_record",
                    )
                    .await);
            }
            record.version += 1;
            Ok(record)
        })
    }

    fn find_payment_by_authorization(
        &self,
        authorization_id: String,
    ) -> RepoFuture<'_, Option<PaymentRecord>> {
        Box::pin(async move {
            let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE authorization_id = $1");
            sqlx::query(&sql)
                .bind(authorization_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?
                .as_ref()
                .map(Self::row_to_payment)
                .transpose()
        })
    }

    fn list_expiring_authorizations(&self, cutoff: DateTime<Utc>) -> RepoFuture<'_, Vec<PaymentRecord>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {PAYMENT_COLUMNS} FROM payment_records \
                 WHERE status = 'authorized' AND authorization_expires_at <= $1 \
                 ORDER BY authorization_expires_at ASC"
            );
            let rows = sqlx::query(&sql)
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await
                .map_err(db)?;
            rows.iter().map(Self::row_to_payment).collect()
        })
    }

    fn insert_dispute(&self, mut dispute: Dispute) -> RepoFuture<'_, Dispute> {
        Box::pin(async move {
            dispute.version = 1;
            let result = sqlx::query(
                r"
                INSERT INTO disputes (
                    id, booking_id, requester_id, provider_id, reason, description,
                    status, decision, responses, opened_at, resolved_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(dispute.id.as_uuid())
            .bind(dispute.booking_id.as_uuid())
            .bind(dispute.requester.as_uuid())
            .bind(dispute.provider.as_uuid())
            .bind(dispute.reason.as_str())
            .bind(&dispute.description)
            .bind(dispute.status.as_str())
            .bind(dispute.decision.as_ref().map(Json))
            .bind(Json(&dispute.responses))
            .bind(dispute.opened_at)
            .bind(dispute.resolved_at)
            .bind(to_i64(dispute.version)?)
            .execute(&self.pool)
            .await
            .map_err(db)?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::Duplicate {
                    entity: "dispute",
                    id: dispute.booking_id.to_string(),
                });
            }
            Ok(dispute)
        })
    }

    fn load_dispute(&self, id: DisputeId) -> RepoFuture<'_, Option<Dispute>> {
        Box::pin(async move {
            let sql = format!("SELECT {DISPUTE_COLUMNS} FROM disputes WHERE id = $1");
            sqlx::query(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?
                .as_ref()
                .map(Self::row_to_dispute)
                .transpose()
        })
    }

    fn find_dispute_for_booking(&self, booking_id: BookingId) -> RepoFuture<'_, Option<Dispute>> {
        Box::pin(async move {
            let sql = format!("SELECT {DISPUTE_COLUMNS} FROM disputes WHERE booking_id = $1");
            sqlx::query(&sql)
                .bind(booking_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?
                .as_ref()
                .map(Self::row_to_dispute)
                .transpose()
        })
    }

    fn save_dispute(&self, mut dispute: Dispute) -> RepoFuture<'_, Dispute> {
        Box::pin(async move {
            let expected = to_i64(dispute.version)?;
            let result = sqlx::query(
                r"
                UPDATE disputes SET
                    status = $2, decision = $3, responses = $4, resolved_at = $5,
                    version = version + 1
                WHERE id = $1 AND version = $6
                ",
            )
            .bind(dispute.id.as_uuid())
            .bind(dispute.status.as_str())
            .bind(dispute.decision.as_ref().map(Json))
            .bind(Json(&dispute.responses))
            .bind(dispute.resolved_at)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(db)?;

            if result.rows_affected() == 0 {
                return Err(self
                    .missing_or_stale("SELECT 1 FROM disputes WHERE id = $1", *dispute.id.as_uuid(), "dispute")
                    .await);
            }
            dispute.version += 1;
            Ok(dispute)
        })
    }
}
