//! Consultant and client actions on existing sessions, and the time-driven
//! part of the lifecycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use consultbook_auth::AuthenticatedUser;
use consultbook_common::{AppError, SessionStatus, SettlementSource};
use consultbook_database::{
    BookingStore, Client, Consultant, PaymentTransaction, ReleaseOutcome, ReleaseRequest, Session,
    TransitionOutcome,
};

use crate::collaborators::{NotificationType, SessionEffects};
use crate::config::BookingRules;
use crate::error::BookingError;
use crate::session_state::{allowed_sources, ensure_transition, is_markable};
use crate::settlement::{RefundReceipt, SettlementOutcome, SettlementService};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub session: Session,
    pub client: Option<Client>,
    pub transactions: Vec<PaymentTransaction>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub started: usize,
    pub completed: usize,
    pub meeting_links: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Cancel,
    Manage,
}

/// Admins may do anything; the owning consultant may do anything with their
/// sessions; the booking client may read and cancel.
fn authorize(user: &AuthenticatedUser, consultant: &Consultant, client: Option<&Client>, access: Access) -> Result<(), AppError> {
    if user.is_admin() || consultant.owner_user_id == user.user_id {
        return Ok(());
    }
    let is_client = client.map_or(false, |c| c.email.eq_ignore_ascii_case(&user.email));
    if is_client && access != Access::Manage {
        return Ok(());
    }
    Err(AppError::Authorization("not allowed to act on this session".to_string()))
}

pub struct SessionService {
    store: Arc<dyn BookingStore>,
    settlement: Arc<SettlementService>,
    effects: Arc<SessionEffects>,
    rules: BookingRules,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        settlement: Arc<SettlementService>,
        effects: Arc<SessionEffects>,
        rules: BookingRules,
    ) -> Self {
        Self {
            store,
            settlement,
            effects,
            rules,
        }
    }

    pub async fn get_session(&self, user: &AuthenticatedUser, session_id: Uuid) -> Result<SessionView, BookingError> {
        let (session, consultant, client) = self.load(session_id).await?;
        authorize(user, &consultant, client.as_ref(), Access::Read)?;
        let transactions = self.store.transactions_for_session(session_id).await?;
        Ok(SessionView {
            session,
            client,
            transactions,
        })
    }

    /// Cancels a PENDING session. Cancel and settlement serialize on the
    /// session row: once a payment has settled, the session is CONFIRMED and
    /// can only leave through a refund.
    pub async fn cancel_session(
        &self,
        user: &AuthenticatedUser,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Session, BookingError> {
        let (session, consultant, client) = self.load(session_id).await?;
        authorize(user, &consultant, client.as_ref(), Access::Cancel)?;
        ensure_transition(session.status, SessionStatus::Cancelled)?;

        let request = ReleaseRequest {
            session_id,
            status: SessionStatus::Cancelled,
            reason: "cancelled by client".to_string(),
            source: SettlementSource::ClientCancellation,
            expired_by: None,
            now,
        };
        match self.store.release_pending_session(&request).await? {
            ReleaseOutcome::Released(session) => {
                tracing::info!(session_id = %session.id, user_id = %user.user_id, "Session cancelled");
                self.effects.notify(NotificationType::SessionCancelled, &session, None).await;
                Ok(session)
            }
            ReleaseOutcome::NotReleasable(current) => Err(BookingError::InvalidTransition {
                from: current.status,
                to: SessionStatus::Cancelled,
            }),
            ReleaseOutcome::NotFound => Err(AppError::NotFound(format!("session {}", session_id)).into()),
        }
    }

    /// Consultant marks a session COMPLETED or NO_SHOW. A CONFIRMED session
    /// whose start has passed is moved to ONGOING first.
    pub async fn mark_session(
        &self,
        user: &AuthenticatedUser,
        session_id: Uuid,
        target: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<Session, BookingError> {
        if !is_markable(target) {
            return Err(AppError::Validation(format!("sessions cannot be marked {}", target)).into());
        }
        let (mut session, consultant, client) = self.load(session_id).await?;
        authorize(user, &consultant, client.as_ref(), Access::Manage)?;

        if session.scheduled_start > now {
            return Err(AppError::Validation("session has not started yet".to_string()).into());
        }
        if target == SessionStatus::Completed && session.status == SessionStatus::Confirmed {
            session = self.transition(session_id, SessionStatus::Ongoing, now).await?;
        }
        ensure_transition(session.status, target)?;

        let marked = self.transition(session_id, target, now).await?;
        tracing::info!(session_id = %marked.id, status = %marked.status, user_id = %user.user_id, "Session marked");
        Ok(marked)
    }

    pub async fn refund_session(
        &self,
        user: &AuthenticatedUser,
        session_id: Uuid,
        amount: Option<Decimal>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RefundReceipt, BookingError> {
        let (_, consultant, client) = self.load(session_id).await?;
        authorize(user, &consultant, client.as_ref(), Access::Manage)?;
        self.settlement.refund_session(session_id, amount, reason, now).await
    }

    /// Runs the reconciliation poll for one order on behalf of its
    /// consultant or an admin.
    pub async fn reconcile_order(
        &self,
        user: &AuthenticatedUser,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, BookingError> {
        let transaction = self
            .store
            .find_transaction_by_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment order {}", order_id)))?;
        let (_, consultant, client) = self.load(transaction.session_id).await?;
        authorize(user, &consultant, client.as_ref(), Access::Manage)?;
        self.settlement.reconcile_order(order_id, now).await
    }

    /// Starts sessions whose time has come, completes those past their end
    /// plus grace and retries missing meeting links.
    pub async fn advance_sessions(&self, now: DateTime<Utc>) -> Result<ProgressReport, BookingError> {
        let batch = self.rules.sweep_batch_size;
        let mut report = ProgressReport::default();

        for session in self.store.sessions_due_to_start(now, batch).await? {
            match self.transition(session.id, SessionStatus::Ongoing, now).await {
                Ok(_) => report.started += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::debug!(session_id = %session.id, error = %e, "Could not start session");
                }
            }
        }

        let cutoff = now - self.rules.completion_grace();
        for session in self.store.sessions_due_to_complete(cutoff, batch).await? {
            match self.transition(session.id, SessionStatus::Completed, now).await {
                Ok(_) => report.completed += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::debug!(session_id = %session.id, error = %e, "Could not complete session");
                }
            }
        }

        for session in self.store.sessions_missing_meeting_link(now, batch).await? {
            if self.effects.ensure_meeting_link(&session, now).await.is_some() {
                report.meeting_links += 1;
            }
        }

        if report != ProgressReport::default() {
            tracing::info!(?report, "Session progression finished");
        }
        Ok(report)
    }

    async fn transition(&self, session_id: Uuid, to: SessionStatus, now: DateTime<Utc>) -> Result<Session, BookingError> {
        match self
            .store
            .transition_session(session_id, allowed_sources(to), to, now)
            .await?
        {
            TransitionOutcome::Applied(session) => Ok(session),
            TransitionOutcome::Rejected(current) => Err(BookingError::InvalidTransition {
                from: current.status,
                to,
            }),
            TransitionOutcome::NotFound => Err(AppError::NotFound(format!("session {}", session_id)).into()),
        }
    }

    async fn load(&self, session_id: Uuid) -> Result<(Session, Consultant, Option<Client>), BookingError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;
        let consultant = self
            .store
            .get_consultant(session.consultant_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("session {} has no consultant", session_id)))?;
        let client = self.store.get_client(session.client_id).await?;
        Ok((session, consultant, client))
    }
}
