//! Server-side price recomputation.
//!
//! `total = base + per_mile × distance + per_hour × duration`, each term
//! rounded to the cent. A client quote is accepted when it is within the
//! configured tolerance of that total.

use crate::error::{BookingError, Result};
use crate::geo;
use crate::types::{Locations, Money, Schedule};
use serde::{Deserialize, Serialize};

/// Rate card used to price a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingCalculator {
    /// Flat fee per booking
    pub base_rate: Money,
    /// Charge per great-circle mile between pickup and delivery
    pub per_mile: Money,
    /// Charge per booked hour, prorated by the minute
    pub per_hour: Money,
    /// Largest accepted difference between quote and computed price
    pub tolerance: Money,
}

impl PricingCalculator {
    /// Creates a calculator from a rate card
    #[must_use]
    pub const fn new(base_rate: Money, per_mile: Money, per_hour: Money, tolerance: Money) -> Self {
        Self {
            base_rate,
            per_mile,
            per_hour,
            tolerance,
        }
    }

    /// Price a service of `distance_miles` lasting `duration_minutes`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn price(&self, distance_miles: f64, duration_minutes: u32) -> Money {
        let distance = if distance_miles.is_finite() {
            distance_miles.max(0.0)
        } else {
            0.0
        };
        let mileage = (self.per_mile.cents() as f64 * distance).round() as u64;
        let time = (self.per_hour.cents() * u64::from(duration_minutes) + 30) / 60;

        Money::from_cents(
            self.base_rate
                .cents()
                .saturating_add(mileage)
                .saturating_add(time),
        )
    }

    /// Price a booking from its locations and schedule.
    #[must_use]
    pub fn quote(&self, locations: &Locations, schedule: &Schedule) -> Money {
        let distance = geo::distance_miles(locations.pickup, locations.delivery);
        self.price(distance, schedule.duration_minutes)
    }

    /// Check a client quote against the recomputed price.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::InvalidQuote`] when the quote is further than
    /// `tolerance` from the computed price.
    pub fn verify(&self, quoted: Money, locations: &Locations, schedule: &Schedule) -> Result<Money> {
        let expected = self.quote(locations, schedule);
        if quoted.abs_diff(expected) > self.tolerance {
            return Err(BookingError::InvalidQuote { quoted, expected });
        }
        Ok(expected)
    }
}

impl Default for PricingCalculator {
    /// $30 base, $1/mile, $2.50/hour, one cent of slack.
    fn default() -> Self {
        Self::new(
            Money::from_cents(3000),
            Money::from_cents(100),
            Money::from_cents(250),
            Money::from_cents(1),
        )
    }
}
