use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};

use consultbook_common::AppError;

use crate::config::BookingRules;
use crate::error::BookingError;
use crate::reservation::{ReservationManager, SweepReport};
use crate::sessions::{ProgressReport, SessionService};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub sweep: SweepReport,
    pub progress: ProgressReport,
}

/// One sweep of expired reservations followed by one progression pass.
/// Used by the scheduler and by the operator CLI.
pub async fn run_maintenance_once(
    reservations: &ReservationManager,
    sessions: &SessionService,
    now: DateTime<Utc>,
) -> Result<MaintenanceReport, BookingError> {
    let sweep = reservations.sweep_expired(now).await?;
    let progress = sessions.advance_sessions(now).await?;
    Ok(MaintenanceReport { sweep, progress })
}

/// Cron-driven background work: the reservation sweep (which also runs
/// reconciliation for expired orders) and session progression.
pub struct MaintenanceJobs {
    scheduler: JobScheduler,
}

impl MaintenanceJobs {
    pub async fn start(
        reservations: Arc<ReservationManager>,
        sessions: Arc<SessionService>,
        rules: &BookingRules,
    ) -> Result<Self, AppError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::Internal(format!("Scheduler creation error: {}", e)))?;

        let sweep = Job::new_async(rules.sweep_cron.as_str(), move |_id, _scheduler| {
            let reservations = reservations.clone();
            Box::pin(async move {
                if let Err(e) = reservations.sweep_expired(Utc::now()).await {
                    tracing::error!(error = %e, "Reservation sweep failed");
                }
            })
        })
        .map_err(|e| AppError::Internal(format!("Invalid SWEEP_CRON: {}", e)))?;

        let progress = Job::new_async(rules.session_progress_cron.as_str(), move |_id, _scheduler| {
            let sessions = sessions.clone();
            Box::pin(async move {
                if let Err(e) = sessions.advance_sessions(Utc::now()).await {
                    tracing::error!(error = %e, "Session progression failed");
                }
            })
        })
        .map_err(|e| AppError::Internal(format!("Invalid SESSION_PROGRESS_CRON: {}", e)))?;

        for job in [sweep, progress] {
            scheduler
                .add(job)
                .await
                .map_err(|e| AppError::Internal(format!("Scheduler job error: {}", e)))?;
        }
        scheduler
            .start()
            .await
            .map_err(|e| AppError::Internal(format!("Scheduler start error: {}", e)))?;

        tracing::info!(
            sweep_cron = %rules.sweep_cron,
            progress_cron = %rules.session_progress_cron,
            "Maintenance jobs started"
        );
        Ok(Self { scheduler })
    }

    pub async fn shutdown(mut self) -> Result<(), AppError> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::Internal(format!("Scheduler shutdown error: {}", e)))?;
        tracing::info!("Maintenance jobs stopped");
        Ok(())
    }
}
