//! Service-region checks and great-circle distance.

use crate::error::{BookingError, Result};
use crate::types::{Coordinates, LocationKind, Locations};
use serde::{Deserialize, Serialize};

/// Mean Earth radius in statute miles.
pub const EARTH_RADIUS_MILES: f64 = 3958.8;

/// Great-circle distance between two points, in miles (haversine).
#[must_use]
pub fn distance_miles(from: Coordinates, to: Coordinates) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let d_lat = (to.latitude - from.latitude).to_radians();
    let d_lon = (to.longitude - from.longitude).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_MILES * c
}

/// Rectangular area the marketplace operates in.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegion {
    /// Southern bound (inclusive)
    pub min_latitude: f64,
    /// Northern bound (inclusive)
    pub max_latitude: f64,
    /// Western bound (inclusive)
    pub min_longitude: f64,
    /// Eastern bound (inclusive)
    pub max_longitude: f64,
}

impl ServiceRegion {
    /// Creates a region from its bounds
    #[must_use]
    pub const fn new(
        min_latitude: f64,
        max_latitude: f64,
        min_longitude: f64,
        max_longitude: f64,
    ) -> Self {
        Self {
            min_latitude,
            max_latitude,
            min_longitude,
            max_longitude,
        }
    }

    /// San Francisco Bay Area launch region.
    #[must_use]
    pub const fn bay_area() -> Self {
        Self::new(36.9, 38.6, -123.2, -121.2)
    }

    /// Whether `point` lies inside the region. Non-finite coordinates never do.
    #[must_use]
    pub fn contains(&self, point: Coordinates) -> bool {
        point.latitude.is_finite()
            && point.longitude.is_finite()
            && (self.min_latitude..=self.max_latitude).contains(&point.latitude)
            && (self.min_longitude..=self.max_longitude).contains(&point.longitude)
    }

    /// Check both booking locations.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::InvalidLocation`] naming the first point outside
    /// the region.
    pub fn validate(&self, locations: &Locations) -> Result<()> {
        for (which, point) in [
            (LocationKind::Pickup, locations.pickup),
            (LocationKind::Delivery, locations.delivery),
        ] {
            if !self.contains(point) {
                return Err(BookingError::InvalidLocation {
                    which,
                    latitude: point.latitude.to_string(),
                    longitude: point.longitude.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Default for ServiceRegion {
    fn default() -> Self {
        Self::bay_area()
    }
}
