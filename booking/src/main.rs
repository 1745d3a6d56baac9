//! Booking lifecycle server.
//!
//! This binary:
//! - Loads configuration from the environment (and `.env`)
//! - Opens the repository (`PostgreSQL` when `DATABASE_URL` is set and the
//!   `postgres` feature is enabled, in-memory otherwise)
//! - Runs the authorization sweep on an interval
//! - Serves the HTTP API until Ctrl+C or SIGTERM
//!
//! # Usage
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/skymarket \
//!     cargo run -p skymarket-booking --features postgres
//! ```

use skymarket_booking::api::{self, AppState};
use skymarket_booking::booking::BookingEnvironment;
use skymarket_booking::coordinator::BookingService;
use skymarket_booking::gateway::MockPaymentGateway;
use skymarket_booking::notifier::LogNotifier;
use skymarket_booking::repository::{BookingRepository, InMemoryRepository};
use skymarket_booking::webhook::WebhookVerifier;
use skymarket_booking::Config;
use skymarket_core::environment::{Clock, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,skymarket_booking=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting booking lifecycle server...");

    let config = Config::from_env();
    info!(
        address = %config.bind_address(),
        persistent = config.database.is_some(),
        "Configuration loaded"
    );

    let repository = build_repository(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let env = BookingEnvironment::new(
        Arc::clone(&clock),
        config.region,
        config.pricing_calculator(),
        LogNotifier::shared(),
    );
    let service = BookingService::new(
        repository,
        MockPaymentGateway::shared(),
        env,
        config.dispute_window(),
        config.payment_settings(),
    );

    let sweep = tokio::spawn(run_sweep(service.clone(), config.sweep_interval()));

    let verifier = WebhookVerifier::new(config.payments.webhook_secret.clone())
        .with_tolerance(config.webhook_tolerance());
    let app = api::router(AppState::new(service, verifier, clock));

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweep.abort();
    info!("Server stopped");
    Ok(())
}

#[cfg(feature = "postgres")]
async fn build_repository(config: &Config) -> anyhow::Result<Arc<dyn BookingRepository>> {
    use skymarket_booking::repository::PostgresRepository;

    if let Some(database) = &config.database {
        info!("Connecting to PostgreSQL...");
        let repository = PostgresRepository::connect(&database.url, database.max_connections).await?;
        repository.migrate().await?;
        info!("PostgreSQL repository ready");
        return Ok(Arc::new(repository));
    }
    warn!("DATABASE_URL not set; bookings are kept in memory");
    Ok(Arc::new(InMemoryRepository::new()))
}

#[cfg(not(feature = "postgres"))]
async fn build_repository(config: &Config) -> anyhow::Result<Arc<dyn BookingRepository>> {
    if config.database.is_some() {
        warn!("DATABASE_URL is set but the `postgres` feature is disabled; using in-memory storage");
    }
    Ok(Arc::new(InMemoryRepository::new()))
}

/// Periodically cancel or flag bookings whose authorization lapsed.
async fn run_sweep(service: BookingService, every: Duration) {
    // `interval` panics on a zero period.
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match service.sweep_expired_authorizations().await {
            Ok(report) => info!(
                cancelled = report.cancelled.len(),
                needs_reauthorization = report.needs_reauthorization.len(),
                failed = report.failed.len(),
                "Authorization sweep finished"
            ),
            Err(e) => error!(error = %e, "Authorization sweep failed"),
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
