use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use consultbook_common::{AppError, SessionStatus, SessionType};
use consultbook_database::{BookingStore, Client, NewReservation, Session, SlotKey};

use crate::availability::offered_slot;
use crate::config::BookingRules;
use crate::error::BookingError;
use crate::settlement::{ExpiryOutcome, SettlementService};

#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub consultant_id: Uuid,
    pub session_type: SessionType,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub client_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
}

/// Result of one pass over expired reservations.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub abandoned: usize,
    pub cancelled: usize,
    pub confirmed: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: ExpiryOutcome) {
        match outcome {
            ExpiryOutcome::Resolved(SessionStatus::Abandoned) => self.abandoned += 1,
            ExpiryOutcome::Resolved(SessionStatus::Cancelled) => self.cancelled += 1,
            ExpiryOutcome::Resolved(SessionStatus::Confirmed) => self.confirmed += 1,
            ExpiryOutcome::Resolved(_) | ExpiryOutcome::Skipped => self.skipped += 1,
            ExpiryOutcome::Deferred => self.deferred += 1,
        }
    }
}

/// Checks a booking amount against the configured limits.
pub fn validate_amount(amount: Decimal, currency: &str, rules: &BookingRules) -> Result<(), AppError> {
    if amount <= Decimal::ZERO {
        return Err(AppError::Validation("amount must be positive".to_string()));
    }
    if amount.normalize().scale() > 2 {
        return Err(AppError::Validation("amount may have at most two decimals".to_string()));
    }
    if amount > rules.max_transaction_amount {
        return Err(AppError::Validation(format!(
            "amount exceeds the maximum of {}",
            rules.max_transaction_amount
        )));
    }
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(AppError::Validation(format!("invalid currency code: {}", currency)));
    }
    Ok(())
}

/// Claims slots for booking attempts.
///
/// The claim itself is a single atomic store operation keyed on the slot
/// identity; this type only decides which key to claim and cleans up stale
/// holds it runs into.
pub struct ReservationManager {
    store: Arc<dyn BookingStore>,
    settlement: Arc<SettlementService>,
    rules: BookingRules,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn BookingStore>, settlement: Arc<SettlementService>, rules: BookingRules) -> Self {
        Self {
            store,
            settlement,
            rules,
        }
    }

    /// Finds or creates the booking client for a consultant, keyed by e-mail.
    pub async fn register_client(
        &self,
        consultant_id: Uuid,
        name: &str,
        email: &str,
        phone: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Client, BookingError> {
        if self.store.get_consultant(consultant_id).await?.is_none() {
            return Err(AppError::NotFound(format!("consultant {}", consultant_id)).into());
        }
        let email = email.trim().to_lowercase();
        Ok(self
            .store
            .upsert_client(consultant_id, name.trim(), &email, phone, now)
            .await?)
    }

    pub async fn reserve(&self, request: &ReservationRequest, now: DateTime<Utc>) -> Result<Session, BookingError> {
        validate_amount(request.amount, &request.currency, &self.rules)?;

        if self.store.get_consultant(request.consultant_id).await?.is_none() {
            return Err(AppError::NotFound(format!("consultant {}", request.consultant_id)).into());
        }

        let patterns = self
            .store
            .list_active_patterns(request.consultant_id, request.session_type)
            .await?;
        let slot = offered_slot(&patterns, request.date, request.start_time, now, self.rules.min_lead())
            .ok_or(BookingError::SlotUnavailable)?;

        let mut amount = request.amount;
        amount.rescale(2);

        let reservation = NewReservation {
            key: SlotKey {
                consultant_id: request.consultant_id,
                session_type: request.session_type,
                date: slot.date,
                start_time: slot.start_time,
            },
            end_time: slot.end_time,
            client_id: request.client_id,
            timezone: slot.timezone,
            scheduled_start: slot.starts_at,
            scheduled_end: slot.ends_at,
            amount,
            currency: request.currency.clone(),
            reservation_expires_at: now + self.rules.reservation_ttl(),
            now,
        };

        if let Some(session) = self.store.reserve_slot(&reservation).await? {
            tracing::info!(
                session_id = %session.id,
                consultant_id = %session.consultant_id,
                date = %session.scheduled_date,
                start = %session.start_time,
                "Slot reserved"
            );
            return Ok(session);
        }

        // A hold whose reservation lapsed is swept here instead of waiting
        // for the next scheduled run. One retry only.
        if self.release_stale_hold(&reservation.key, now).await? {
            if let Some(session) = self.store.reserve_slot(&reservation).await? {
                tracing::info!(session_id = %session.id, "Slot reserved after releasing an expired hold");
                return Ok(session);
            }
        }

        tracing::debug!(
            consultant_id = %request.consultant_id,
            date = %request.date,
            start = %request.start_time,
            "Slot already taken"
        );
        Err(BookingError::SlotUnavailable)
    }

    async fn release_stale_hold(&self, key: &SlotKey, now: DateTime<Utc>) -> Result<bool, BookingError> {
        let holder = match self.store.session_holding_slot(key).await? {
            Some(session) if session.status == SessionStatus::Pending && session.reservation_expired(now) => session,
            _ => return Ok(false),
        };
        let outcome = self.settlement.expire_session(&holder, now).await?;
        Ok(matches!(
            outcome,
            ExpiryOutcome::Resolved(SessionStatus::Abandoned) | ExpiryOutcome::Resolved(SessionStatus::Cancelled)
        ))
    }

    /// Resolves every PENDING session whose reservation expired at or before
    /// `now`, up to the configured batch size. A failure on one session does
    /// not stop the pass.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, BookingError> {
        let expired = self
            .store
            .list_expired_pending_sessions(now, self.rules.sweep_batch_size)
            .await?;

        let mut report = SweepReport {
            examined: expired.len(),
            ..SweepReport::default()
        };
        for session in &expired {
            match self.settlement.expire_session(session, now).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(session_id = %session.id, error = %e, "Failed to expire reservation");
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(?report, "Reservation sweep finished");
        }
        Ok(report)
    }
}
