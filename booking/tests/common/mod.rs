//! Shared fixtures for the booking integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use chrono::Duration;
use skymarket_booking::booking::{Booking, BookingEnvironment, BookingRequest};
use skymarket_booking::coordinator::{BookingService, PaymentSettings};
use skymarket_booking::gateway::ScriptedPaymentGateway;
use skymarket_booking::geo::{EARTH_RADIUS_MILES, ServiceRegion};
use skymarket_booking::lifecycle::BookingStatus;
use skymarket_booking::notifier::RecordingNotifier;
use skymarket_booking::pricing::PricingCalculator;
use skymarket_booking::repository::{BookingRepository, InMemoryRepository};
use skymarket_booking::types::{
    Actor, Coordinates, Locations, Money, PartyId, Schedule, ServiceId,
};
use skymarket_testing::{ManualClock, epoch};
use std::sync::Arc;

/// A booking service over in-memory storage, a scripted gateway and a
/// hand-driven clock.
pub struct Harness {
    pub service: BookingService,
    pub gateway: Arc<ScriptedPaymentGateway>,
    pub repository: Arc<InMemoryRepository>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub requester: PartyId,
    pub provider: PartyId,
    pub admin: PartyId,
}

impl Harness {
    /// 14-day dispute window, default payment settings.
    pub fn new() -> Self {
        Self::with_settings(PaymentSettings::default())
    }

    pub fn with_settings(settings: PaymentSettings) -> Self {
        let gateway = Arc::new(ScriptedPaymentGateway::new());
        let repository = Arc::new(InMemoryRepository::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(epoch()));

        let env = BookingEnvironment::new(
            clock.clone(),
            ServiceRegion::bay_area(),
            PricingCalculator::default(),
            notifier.clone(),
        );
        let service = BookingService::new(
            repository.clone(),
            gateway.clone(),
            env,
            Duration::days(14),
            settings,
        );

        Self {
            service,
            gateway,
            repository,
            notifier,
            clock,
            requester: PartyId::new(),
            provider: PartyId::new(),
            admin: PartyId::new(),
        }
    }

    /// A second service sharing this harness's gateway, notifier and clock
    /// but storing through `repository`.
    pub fn service_over(&self, repository: Arc<dyn BookingRepository>) -> BookingService {
        let env = BookingEnvironment::new(
            self.clock.clone(),
            ServiceRegion::bay_area(),
            PricingCalculator::default(),
            self.notifier.clone(),
        );
        BookingService::new(
            repository,
            self.gateway.clone(),
            env,
            Duration::days(14),
            PaymentSettings::default(),
        )
    }

    pub fn requester(&self) -> Actor {
        Actor::Party(self.requester)
    }

    pub fn provider(&self) -> Actor {
        Actor::Party(self.provider)
    }

    pub fn admin(&self) -> Actor {
        Actor::Admin(self.admin)
    }

    /// 10 miles, one hour, quoted at the correct $42.50.
    pub fn request(&self) -> BookingRequest {
        BookingRequest {
            requester: self.requester,
            provider: self.provider,
            service: ServiceId::new(),
            schedule: Schedule {
                starts_at: epoch() + Duration::days(2),
                duration_minutes: 60,
            },
            locations: ten_mile_locations(),
            quoted_amount: Money::from_cents(4250),
        }
    }

    pub async fn pending(&self) -> Booking {
        self.service.create_booking(self.request()).await.unwrap()
    }

    /// Walk a new booking to `completed`, one minute per step.
    pub async fn completed(&self) -> Booking {
        let booking = self.pending().await;
        for status in [
            BookingStatus::Accepted,
            BookingStatus::InProgress,
            BookingStatus::Completed,
        ] {
            self.clock.advance(Duration::minutes(1));
            self.service
                .transition(booking.id, status, self.provider())
                .await
                .unwrap();
        }
        self.service.booking(booking.id).await.unwrap()
    }
}

/// Ten miles due north inside the Bay Area region.
pub fn ten_mile_locations() -> Locations {
    let pickup = Coordinates::new(37.5, -122.3);
    let degrees = 10.0 / (EARTH_RADIUS_MILES * std::f64::consts::PI / 180.0);
    Locations {
        pickup,
        delivery: Coordinates::new(pickup.latitude + degrees, pickup.longitude),
    }
}
