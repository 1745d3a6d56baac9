//! Configuration management for the booking server.
//!
//! Loads configuration from environment variables with sensible defaults.
//! `main` reads a `.env` file first (via `dotenvy`) when one is present.

use crate::coordinator::PaymentSettings;
use crate::geo::ServiceRegion;
use crate::pricing::PricingCalculator;
use crate::types::Money;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server
    pub server: ServerConfig,
    /// `PostgreSQL`; in-memory storage when absent
    pub database: Option<DatabaseConfig>,
    /// Payment provider
    pub payments: PaymentsConfig,
    /// Rate card
    pub pricing: PricingConfig,
    /// Where bookings may take place
    pub region: ServiceRegion,
    /// Dispute rules
    pub disputes: DisputeConfig,
    /// Authorization sweep
    pub sweep: SweepConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Payment provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentsConfig {
    /// Upper bound on one provider call, in seconds
    pub provider_timeout_secs: u64,
    /// Assumed authorization lifetime, in days
    pub authorization_ttl_days: i64,
    /// Shared secret for webhook signatures
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    /// Accepted webhook clock skew, in seconds
    pub webhook_tolerance_secs: i64,
}

/// Rate card in cents
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Flat fee
    pub base_rate_cents: u64,
    /// Per mile
    pub per_mile_cents: u64,
    /// Per hour
    pub per_hour_cents: u64,
    /// Accepted quote drift
    pub tolerance_cents: u64,
}

/// Dispute configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DisputeConfig {
    /// Days after completion during which a dispute may be opened
    pub window_days: i64,
}

/// Authorization sweep configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Seconds between sweeps
    pub interval_secs: u64,
}

fn var_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = PricingCalculator::default();
        let region = ServiceRegion::default();
        Self {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: var_or("PORT", 8080),
            },
            database: env::var("DATABASE_URL").ok().map(|url| DatabaseConfig {
                url,
                max_connections: var_or("DATABASE_MAX_CONNECTIONS", 10),
            }),
            payments: PaymentsConfig {
                provider_timeout_secs: var_or("PAYMENT_PROVIDER_TIMEOUT_SECS", 10),
                authorization_ttl_days: var_or("PAYMENT_AUTHORIZATION_TTL_DAYS", 7),
                webhook_secret: env::var("PAYMENT_WEBHOOK_SECRET")
                    .unwrap_or_else(|_| "whsec_development".to_string()),
                webhook_tolerance_secs: var_or("PAYMENT_WEBHOOK_TOLERANCE_SECS", 300),
            },
            pricing: PricingConfig {
                base_rate_cents: var_or("PRICING_BASE_RATE_CENTS", defaults.base_rate.cents()),
                per_mile_cents: var_or("PRICING_PER_MILE_CENTS", defaults.per_mile.cents()),
                per_hour_cents: var_or("PRICING_PER_HOUR_CENTS", defaults.per_hour.cents()),
                tolerance_cents: var_or("PRICING_TOLERANCE_CENTS", defaults.tolerance.cents()),
            },
            region: ServiceRegion::new(
                var_or("REGION_MIN_LATITUDE", region.min_latitude),
                var_or("REGION_MAX_LATITUDE", region.max_latitude),
                var_or("REGION_MIN_LONGITUDE", region.min_longitude),
                var_or("REGION_MAX_LONGITUDE", region.max_longitude),
            ),
            disputes: DisputeConfig {
                window_days: var_or("DISPUTE_WINDOW_DAYS", 14),
            },
            sweep: SweepConfig {
                interval_secs: var_or("AUTHORIZATION_SWEEP_INTERVAL_SECS", 3600),
            },
        }
    }

    /// Address to bind, `host:port`
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Payment coordinator settings
    #[must_use]
    pub fn payment_settings(&self) -> PaymentSettings {
        PaymentSettings {
            provider_timeout: Duration::from_secs(self.payments.provider_timeout_secs),
            authorization_ttl: chrono::Duration::days(self.payments.authorization_ttl_days),
        }
    }

    /// Rate card
    #[must_use]
    pub const fn pricing_calculator(&self) -> PricingCalculator {
        PricingCalculator::new(
            Money::from_cents(self.pricing.base_rate_cents),
            Money::from_cents(self.pricing.per_mile_cents),
            Money::from_cents(self.pricing.per_hour_cents),
            Money::from_cents(self.pricing.tolerance_cents),
        )
    }

    /// Dispute window
    #[must_use]
    pub fn dispute_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.disputes.window_days)
    }

    /// Webhook timestamp tolerance
    #[must_use]
    pub fn webhook_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.payments.webhook_tolerance_secs)
    }

    /// Time between authorization sweeps
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_domain_defaults() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: None,
            payments: PaymentsConfig {
                provider_timeout_secs: 10,
                authorization_ttl_days: 7,
                webhook_secret: "s".to_string(),
                webhook_tolerance_secs: 300,
            },
            pricing: PricingConfig {
                base_rate_cents: 3000,
                per_mile_cents: 100,
                per_hour_cents: 250,
                tolerance_cents: 1,
            },
            region: ServiceRegion::bay_area(),
            disputes: DisputeConfig { window_days: 14 },
            sweep: SweepConfig { interval_secs: 3600 },
        };

        assert_eq!(config.bind_address(), "127.0.0.1:8080");
        assert_eq!(config.payment_settings(), PaymentSettings::default());
        assert_eq!(config.pricing_calculator(), PricingCalculator::default());
        assert_eq!(config.dispute_window(), chrono::Duration::days(14));
    }
}
