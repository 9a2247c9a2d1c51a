use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use consultbook_common::{
    AppError, PaymentStatus, SessionStatus, SessionType, SettlementSource,
};

use crate::models::{
    AvailabilitySlot, Client, Consultant, PaymentTransaction, Session, SlotKey,
    WeeklyAvailabilityPattern,
};

/// Everything needed to claim one slot and open a PENDING session for it.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub key: SlotKey,
    pub end_time: NaiveTime,
    pub client_id: Uuid,
    pub timezone: String,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub amount: Decimal,
    pub currency: String,
    pub reservation_expires_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum InsertTransactionOutcome {
    Inserted(PaymentTransaction),
    /// Another PENDING transaction already exists for the session.
    Existing(PaymentTransaction),
    /// The session is no longer PENDING, or its reservation has expired.
    SessionNotPending(Session),
}

/// Terminal outcome to compare-and-set onto a PENDING payment.
#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub gateway_order_id: String,
    pub status: PaymentStatus,
    pub gateway_payment_id: Option<String>,
    pub failure_reason: Option<String>,
    pub source: SettlementSource,
    /// Session status applied when `status` is FAILED.
    pub failed_session_status: SessionStatus,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum SettlementResult {
    /// This caller won the compare-and-set.
    Applied {
        transaction: PaymentTransaction,
        session: Session,
    },
    /// The transaction had already left PENDING.
    AlreadySettled {
        transaction: PaymentTransaction,
        session: Session,
    },
    UnknownOrder,
}

/// Release of a reservation that never got paid.
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub reason: String,
    pub source: SettlementSource,
    /// When set, the release only applies if the reservation expired at or
    /// before this instant.
    pub expired_by: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Released(Session),
    NotReleasable(Session),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct RefundRecord {
    pub payment_id: Uuid,
    /// Payment status observed before the gateway refund was issued.
    pub expected_status: PaymentStatus,
    pub new_payment_status: PaymentStatus,
    pub refund: PaymentTransaction,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum RefundOutcome {
    Recorded {
        payment: PaymentTransaction,
        refund: PaymentTransaction,
        session: Session,
    },
    /// The payment changed while the gateway call was in flight.
    Conflict(PaymentTransaction),
}

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(Session),
    Rejected(Session),
    NotFound,
}

/// The shared relational store. Every method is atomic on its own; no
/// caller holds a lock across two calls.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert_consultant(&self, consultant: &Consultant) -> Result<(), AppError>;

    async fn get_consultant(&self, consultant_id: Uuid) -> Result<Option<Consultant>, AppError>;

    async fn insert_pattern(&self, pattern: &WeeklyAvailabilityPattern) -> Result<(), AppError>;

    async fn list_active_patterns(
        &self,
        consultant_id: Uuid,
        session_type: SessionType,
    ) -> Result<Vec<WeeklyAvailabilityPattern>, AppError>;

    /// Pre-materializes a slot row. Fails with `Conflict` when the key exists.
    async fn insert_slot(&self, slot: &AvailabilitySlot) -> Result<(), AppError>;

    async fn list_slots(
        &self,
        consultant_id: Uuid,
        session_type: SessionType,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AvailabilitySlot>, AppError>;

    async fn upsert_client(
        &self,
        consultant_id: Uuid,
        name: &str,
        email: &str,
        phone: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Client, AppError>;

    async fn get_client(&self, client_id: Uuid) -> Result<Option<Client>, AppError>;

    /// Claims the slot (insert-or-fail when absent, `is_booked` false→true
    /// when present) and creates the PENDING session in one atomic step.
    /// Returns `None` when another caller holds the slot or it is blocked.
    async fn reserve_slot(&self, reservation: &NewReservation) -> Result<Option<Session>, AppError>;

    /// The session currently holding the slot, if any.
    async fn session_holding_slot(&self, key: &SlotKey) -> Result<Option<Session>, AppError>;

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, AppError>;

    /// Expired PENDING sessions, those never deferred first, then by how
    /// long ago their reconciliation was last put off.
    async fn list_expired_pending_sessions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Session>, AppError>;

    /// Stamps a deferred reconciliation so later sweeps reach other holds first.
    async fn defer_reconciliation(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError>;

    /// Moves a PENDING session to CANCELLED/ABANDONED, fails any PENDING
    /// transaction and frees the slot, all at once.
    async fn release_pending_session(&self, request: &ReleaseRequest) -> Result<ReleaseOutcome, AppError>;

    async fn pending_transaction_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, AppError>;

    async fn insert_pending_transaction(
        &self,
        transaction: &PaymentTransaction,
        now: DateTime<Utc>,
    ) -> Result<InsertTransactionOutcome, AppError>;

    async fn find_transaction_by_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentTransaction>, AppError>;

    async fn transactions_for_session(&self, session_id: Uuid) -> Result<Vec<PaymentTransaction>, AppError>;

    /// The compare-and-set: PENDING → SUCCESS/FAILED only if still PENDING,
    /// together with the session transition that settlement implies.
    async fn settle_transaction(&self, request: &SettlementRequest) -> Result<SettlementResult, AppError>;

    /// Notes a failed payment attempt on an order that is still PENDING,
    /// without settling it; the client may retry on the same order. Returns
    /// the transaction as it stands, `None` for an unknown order.
    async fn record_failed_attempt(
        &self,
        gateway_order_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentTransaction>, AppError>;

    async fn record_refund(&self, record: &RefundRecord) -> Result<RefundOutcome, AppError>;

    /// Conditional status update for time-driven and consultant-driven
    /// transitions. Never accepts CONFIRMED as a target.
    async fn transition_session(
        &self,
        session_id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, AppError>;

    async fn sessions_due_to_start(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Session>, AppError>;

    async fn sessions_due_to_complete(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Session>, AppError>;

    async fn sessions_missing_meeting_link(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Session>, AppError>;

    async fn set_meeting_link(&self, session_id: Uuid, link: &str, now: DateTime<Utc>) -> Result<(), AppError>;
}

pub(crate) fn reject_confirm_target(to: SessionStatus) -> Result<(), AppError> {
    if to == SessionStatus::Confirmed {
        return Err(AppError::Validation(
            "sessions are confirmed only by payment settlement".to_string(),
        ));
    }
    Ok(())
}

/// Session statuses that hold their slot.
pub fn holds_slot(status: SessionStatus) -> bool {
    !matches!(status, SessionStatus::Cancelled | SessionStatus::Abandoned)
}
