//! Value objects shared by the booking, payment and dispute aggregates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a booking
    BookingId
);

uuid_id!(
    /// Unique identifier for a dispute
    DisputeId
);

uuid_id!(
    /// Unique identifier for a marketplace party (requester, provider or admin)
    PartyId
);

uuid_id!(
    /// Unique identifier for a catalog service offered by a provider
    ServiceId
);

// ============================================================================
// Money Value Object (cents-based to avoid floating point errors)
// ============================================================================

/// Represents money in cents to avoid floating-point arithmetic errors
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Zero dollars
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Creates a `Money` value from whole dollars, saturating on overflow
    #[must_use]
    pub const fn from_dollars(dollars: u64) -> Self {
        Self(dollars.saturating_mul(100))
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Returns the amount in dollars (rounded down)
    #[must_use]
    pub const fn dollars(&self) -> u64 {
        self.0 / 100
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Subtracts two money amounts (returns None if result would be negative)
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        if self.0 >= other.0 {
            Some(Self(self.0 - other.0))
        } else {
            None
        }
    }

    /// Adds, capping at the largest representable amount
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Subtracts, flooring at zero
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Absolute difference between two amounts
    #[must_use]
    pub const fn abs_diff(self, other: Self) -> Self {
        Self(self.0.abs_diff(other.0))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:02}", self.dollars(), self.0 % 100)
    }
}

// ============================================================================
// Location and schedule
// ============================================================================

/// A WGS84 point in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude, -90..=90
    pub latitude: f64,
    /// Longitude, -180..=180
    pub longitude: f64,
}

impl Coordinates {
    /// Creates a new point
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.latitude, self.longitude)
    }
}

/// Pickup and delivery points of a booking.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Locations {
    /// Where the drone picks up
    pub pickup: Coordinates,
    /// Where the drone delivers
    pub delivery: Coordinates,
}

/// Which of the two booking locations a validation error refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    /// Pickup point
    Pickup,
    /// Delivery point
    Delivery,
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pickup => write!(f, "pickup"),
            Self::Delivery => write!(f, "delivery"),
        }
    }
}

/// When the service happens and for how long.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Scheduled start
    pub starts_at: DateTime<Utc>,
    /// Booked duration in minutes
    pub duration_minutes: u32,
}

// ============================================================================
// Actors
// ============================================================================

/// Who is asking for a change.
///
/// A party's role (requester or provider) is relative to a booking; admins and
/// the system actor are global.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// A marketplace participant
    Party(PartyId),
    /// A marketplace administrator or arbitrator
    Admin(PartyId),
    /// The booking service itself (payment failures, sweeps)
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Party(id) => write!(f, "party:{id}"),
            Self::Admin(id) => write!(f, "admin:{id}"),
            Self::System => write!(f, "system"),
        }
    }
}

/// The role an [`Actor`] plays with respect to one booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The party that requested the service
    Requester,
    /// The party delivering the service
    Provider,
    /// Marketplace administrator / arbitrator
    Admin,
    /// Internal automation
    System,
}

impl Role {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Provider => "provider",
            Self::Admin => "admin",
            Self::System => "system",
        }
    }
}

/// Resolve the role of `actor` on a booking between `requester` and `provider`.
///
/// Returns `None` for a party that is neither.
#[must_use]
pub fn role_of(actor: Actor, requester: PartyId, provider: PartyId) -> Option<Role> {
    match actor {
        Actor::Party(id) if id == requester => Some(Role::Requester),
        Actor::Party(id) if id == provider => Some(Role::Provider),
        Actor::Party(_) => None,
        Actor::Admin(_) => Some(Role::Admin),
        Actor::System => Some(Role::System),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_display() {
        assert_eq!(Money::from_cents(4250).to_string(), "$42.50");
        assert_eq!(Money::from_cents(5).to_string(), "$0.05");
        assert_eq!(Money::from_dollars(30).to_string(), "$30.00");
    }

    #[test]
    fn test_money_arithmetic() {
        let a = Money::from_cents(4250);
        let b = Money::from_cents(1500);
        assert_eq!(a.checked_sub(b), Some(Money::from_cents(2750)));
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(b.saturating_sub(a), Money::ZERO);
        assert_eq!(a.abs_diff(b), b.abs_diff(a));
        assert_eq!(Money::from_cents(u64::MAX).checked_add(b), None);
    }

    #[test]
    fn test_role_resolution() {
        let requester = PartyId::new();
        let provider = PartyId::new();

        assert_eq!(
            role_of(Actor::Party(requester), requester, provider),
            Some(Role::Requester)
        );
        assert_eq!(
            role_of(Actor::Party(provider), requester, provider),
            Some(Role::Provider)
        );
        assert_eq!(role_of(Actor::Party(PartyId::new()), requester, provider), None);
        assert_eq!(
            role_of(Actor::Admin(PartyId::new()), requester, provider),
            Some(Role::Admin)
        );
        assert_eq!(role_of(Actor::System, requester, provider), Some(Role::System));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_actor_serde_shape() {
        let id = PartyId::new();
        let json = serde_json::to_value(Actor::Party(id)).unwrap();
        assert_eq!(json["kind"], "party");
        assert_eq!(json["id"], id.to_string());

        let system: Actor = serde_json::from_str(r#"{"kind":"system"}"#).unwrap();
        assert_eq!(system, Actor::System);
    }
}
