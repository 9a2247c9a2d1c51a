use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consultbook_booking::{
    collaborators::{HttpMeetingLinkProvider, HttpNotifier, LoggingNotifier, MeetingLinkProvider, NoMeetingLinks, Notifier},
    config::{BookingConfig, StoreBackend},
    create_app,
    gateways::RazorpayGateway,
    jobs::MaintenanceJobs,
    AppState,
};
use consultbook_database::{close_pool, create_pool, run_migrations, BookingStore, DbPool, MemoryStore, PgBookingStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consultbook_booking=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = BookingConfig::from_env().context("invalid configuration")?;

    // Storage
    let (store, pool): (Arc<dyn BookingStore>, Option<DbPool>) = match config.store {
        StoreBackend::Postgres => {
            let pool = create_pool(&config.database).await.context("database unavailable")?;
            run_migrations(&pool).await.context("migrations failed")?;
            (Arc::new(PgBookingStore::new(pool.clone())), Some(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; data is lost on restart");
            (Arc::new(MemoryStore::new()), None)
        }
    };

    // Collaborators
    let gateway = Arc::new(RazorpayGateway::new(config.razorpay.clone()));
    let meetings: Arc<dyn MeetingLinkProvider> = match &config.collaborators.meetings_service_url {
        Some(url) => Arc::new(HttpMeetingLinkProvider::new(url.clone())),
        None => Arc::new(NoMeetingLinks),
    };
    let notifier: Arc<dyn Notifier> = match &config.collaborators.notifications_service_url {
        Some(url) => Arc::new(HttpNotifier::new(url.clone())),
        None => Arc::new(LoggingNotifier),
    };

    let state = AppState::new(config.clone(), store, gateway, meetings, notifier);
    let jobs = MaintenanceJobs::start(state.reservations.clone(), state.sessions.clone(), &config.booking)
        .await
        .context("failed to start maintenance jobs")?;

    let app = create_app(state);
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("cannot bind {}", address))?;

    tracing::info!("Booking Service listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    if let Err(e) = jobs.shutdown().await {
        tracing::warn!(error = %e, "Scheduler did not stop cleanly");
    }
    if let Some(pool) = pool {
        close_pool(&pool).await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
