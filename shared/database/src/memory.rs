use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use consultbook_common::{
    AppError, PaymentStatus, SessionPaymentStatus, SessionStatus, SessionType, TransactionKind,
};

use crate::models::{
    AvailabilitySlot, Client, Consultant, PaymentTransaction, Session, SlotKey,
    WeeklyAvailabilityPattern,
};
use crate::store::{
    holds_slot, reject_confirm_target, BookingStore, InsertTransactionOutcome, NewReservation,
    RefundOutcome, RefundRecord, ReleaseOutcome, ReleaseRequest, SettlementRequest,
    SettlementResult, TransitionOutcome,
};

#[derive(Default)]
struct MemoryState {
    consultants: HashMap<Uuid, Consultant>,
    clients: HashMap<Uuid, Client>,
    patterns: Vec<WeeklyAvailabilityPattern>,
    slots: HashMap<Uuid, AvailabilitySlot>,
    slot_index: HashMap<SlotKey, Uuid>,
    sessions: HashMap<Uuid, Session>,
    transactions: Vec<PaymentTransaction>,
    deferred: HashMap<Uuid, DateTime<Utc>>,
}

impl MemoryState {
    fn free_slot(&mut self, slot_id: Uuid, now: DateTime<Utc>) {
        if let Some(slot) = self.slots.get_mut(&slot_id) {
            slot.is_booked = false;
            slot.updated_at = now;
        }
    }

    fn session(&self, session_id: Uuid) -> Result<Session, AppError> {
        self.sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("transaction references missing session {}", session_id)))
    }
}

/// Single-process store. One mutex plays the role the database plays in
/// production: every trait method runs entirely under it.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn insert_consultant(&self, consultant: &Consultant) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.consultants.values().any(|c| c.slug == consultant.slug) {
            return Err(AppError::Conflict(format!("consultant slug {} is taken", consultant.slug)));
        }
        state.consultants.insert(consultant.id, consultant.clone());
        Ok(())
    }

    async fn get_consultant(&self, consultant_id: Uuid) -> Result<Option<Consultant>, AppError> {
        Ok(self.state.lock().await.consultants.get(&consultant_id).cloned())
    }

    async fn insert_pattern(&self, pattern: &WeeklyAvailabilityPattern) -> Result<(), AppError> {
        self.state.lock().await.patterns.push(pattern.clone());
        Ok(())
    }

    async fn list_active_patterns(
        &self,
        consultant_id: Uuid,
        session_type: SessionType,
    ) -> Result<Vec<WeeklyAvailabilityPattern>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .patterns
            .iter()
            .filter(|p| p.consultant_id == consultant_id && p.session_type == session_type && p.is_active)
            .cloned()
            .collect())
    }

    async fn insert_slot(&self, slot: &AvailabilitySlot) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let key = slot.key();
        if state.slot_index.contains_key(&key) {
            return Err(AppError::Conflict("slot already exists".to_string()));
        }
        state.slot_index.insert(key, slot.id);
        state.slots.insert(slot.id, slot.clone());
        Ok(())
    }

    async fn list_slots(
        &self,
        consultant_id: Uuid,
        session_type: SessionType,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AvailabilitySlot>, AppError> {
        let state = self.state.lock().await;
        let mut slots: Vec<AvailabilitySlot> = state
            .slots
            .values()
            .filter(|s| {
                s.consultant_id == consultant_id
                    && s.session_type == session_type
                    && s.slot_date >= from
                    && s.slot_date <= to
            })
            .cloned()
            .collect();
        slots.sort_by_key(|s| (s.slot_date, s.start_time));
        Ok(slots)
    }

    async fn upsert_client(
        &self,
        consultant_id: Uuid,
        name: &str,
        email: &str,
        phone: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Client, AppError> {
        let mut state = self.state.lock().await;
        let email = email.trim().to_lowercase();
        if let Some(existing) = state
            .clients
            .values_mut()
            .find(|c| c.consultant_id == consultant_id && c.email == email)
        {
            existing.name = name.to_string();
            if let Some(phone) = phone {
                existing.phone = Some(phone.to_string());
            }
            return Ok(existing.clone());
        }

        let client = Client {
            id: Uuid::new_v4(),
            consultant_id,
            name: name.to_string(),
            email,
            phone: phone.map(str::to_string),
            created_at: now,
        };
        state.clients.insert(client.id, client.clone());
        Ok(client)
    }

    async fn get_client(&self, client_id: Uuid) -> Result<Option<Client>, AppError> {
        Ok(self.state.lock().await.clients.get(&client_id).cloned())
    }

    async fn reserve_slot(&self, reservation: &NewReservation) -> Result<Option<Session>, AppError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let r = reservation;

        let slot_id = match state.slot_index.get(&r.key).copied() {
            Some(slot_id) => {
                let slot = state
                    .slots
                    .get_mut(&slot_id)
                    .ok_or_else(|| AppError::Internal("slot index out of sync".to_string()))?;
                if slot.is_booked || slot.is_blocked {
                    return Ok(None);
                }
                slot.is_booked = true;
                slot.updated_at = r.now;
                slot_id
            }
            None => {
                let slot = AvailabilitySlot {
                    id: Uuid::new_v4(),
                    consultant_id: r.key.consultant_id,
                    session_type: r.key.session_type,
                    slot_date: r.key.date,
                    start_time: r.key.start_time,
                    end_time: r.end_time,
                    is_booked: true,
                    is_blocked: false,
                    created_at: r.now,
                    updated_at: r.now,
                };
                let slot_id = slot.id;
                state.slot_index.insert(r.key, slot_id);
                state.slots.insert(slot_id, slot);
                slot_id
            }
        };

        let session = Session {
            id: Uuid::new_v4(),
            consultant_id: r.key.consultant_id,
            client_id: r.client_id,
            slot_id,
            session_type: r.key.session_type,
            scheduled_date: r.key.date,
            start_time: r.key.start_time,
            end_time: r.end_time,
            timezone: r.timezone.clone(),
            scheduled_start: r.scheduled_start,
            scheduled_end: r.scheduled_end,
            amount: r.amount,
            currency: r.currency.clone(),
            status: SessionStatus::Pending,
            payment_status: SessionPaymentStatus::Unpaid,
            reservation_expires_at: r.reservation_expires_at,
            meeting_link: None,
            created_at: r.now,
            updated_at: r.now,
        };
        state.sessions.insert(session.id, session.clone());
        Ok(Some(session))
    }

    async fn session_holding_slot(&self, key: &SlotKey) -> Result<Option<Session>, AppError> {
        let state = self.state.lock().await;
        let slot_id = match state.slot_index.get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(state
            .sessions
            .values()
            .filter(|s| s.slot_id == slot_id && holds_slot(s.status))
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, AppError> {
        Ok(self.state.lock().await.sessions.get(&session_id).cloned())
    }

    async fn list_expired_pending_sessions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Session>, AppError> {
        let state = self.state.lock().await;
        let mut expired: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending && s.reservation_expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|s| (state.deferred.get(&s.id).copied(), s.reservation_expires_at, s.id));
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn defer_reconciliation(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        self.state.lock().await.deferred.insert(session_id, now);
        Ok(())
    }

    async fn release_pending_session(&self, request: &ReleaseRequest) -> Result<ReleaseOutcome, AppError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let session = match state.sessions.get_mut(&request.session_id) {
            Some(session) => session,
            None => return Ok(ReleaseOutcome::NotFound),
        };
        let not_expired = request
            .expired_by
            .map_or(false, |cutoff| session.reservation_expires_at > cutoff);
        if session.status != SessionStatus::Pending || not_expired {
            return Ok(ReleaseOutcome::NotReleasable(session.clone()));
        }

        let mut failed_payment = false;
        for tx in state.transactions.iter_mut().filter(|t| {
            t.session_id == request.session_id
                && t.kind == TransactionKind::Payment
                && t.status == PaymentStatus::Pending
        }) {
            tx.status = PaymentStatus::Failed;
            tx.failure_reason = Some(request.reason.clone());
            tx.settled_by = Some(request.source);
            tx.settled_at = Some(request.now);
            tx.updated_at = request.now;
            failed_payment = true;
        }

        session.status = request.status;
        if failed_payment {
            session.payment_status = SessionPaymentStatus::Failed;
        }
        session.updated_at = request.now;
        let released = session.clone();

        state.free_slot(released.slot_id, request.now);
        Ok(ReleaseOutcome::Released(released))
    }

    async fn pending_transaction_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .find(|t| {
                t.session_id == session_id
                    && t.kind == TransactionKind::Payment
                    && t.status == PaymentStatus::Pending
            })
            .cloned())
    }

    async fn insert_pending_transaction(
        &self,
        transaction: &PaymentTransaction,
        now: DateTime<Utc>,
    ) -> Result<InsertTransactionOutcome, AppError> {
        let mut state = self.state.lock().await;

        let session = state
            .sessions
            .get(&transaction.session_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {}", transaction.session_id)))?;
        if session.status != SessionStatus::Pending || session.reservation_expired(now) {
            return Ok(InsertTransactionOutcome::SessionNotPending(session));
        }

        if let Some(existing) = state.transactions.iter().find(|t| {
            t.session_id == transaction.session_id
                && t.kind == TransactionKind::Payment
                && t.status == PaymentStatus::Pending
        }) {
            return Ok(InsertTransactionOutcome::Existing(existing.clone()));
        }

        if transaction.gateway_order_id.is_some()
            && state
                .transactions
                .iter()
                .any(|t| t.gateway_order_id == transaction.gateway_order_id)
        {
            return Err(AppError::Conflict("gateway order already recorded".to_string()));
        }

        state.transactions.push(transaction.clone());
        Ok(InsertTransactionOutcome::Inserted(transaction.clone()))
    }

    async fn find_transaction_by_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .find(|t| t.kind == TransactionKind::Payment && t.gateway_order_id.as_deref() == Some(gateway_order_id))
            .cloned())
    }

    async fn transactions_for_session(&self, session_id: Uuid) -> Result<Vec<PaymentTransaction>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn settle_transaction(&self, request: &SettlementRequest) -> Result<SettlementResult, AppError> {
        if !matches!(request.status, PaymentStatus::Success | PaymentStatus::Failed) {
            return Err(AppError::Validation("settlement must be SUCCESS or FAILED".to_string()));
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let index = match state.transactions.iter().position(|t| {
            t.kind == TransactionKind::Payment
                && t.gateway_order_id.as_deref() == Some(request.gateway_order_id.as_str())
        }) {
            Some(index) => index,
            None => return Ok(SettlementResult::UnknownOrder),
        };

        let tx = &mut state.transactions[index];
        if tx.status != PaymentStatus::Pending {
            let transaction = tx.clone();
            let session = state.session(transaction.session_id)?;
            return Ok(SettlementResult::AlreadySettled { transaction, session });
        }

        tx.status = request.status;
        if request.gateway_payment_id.is_some() {
            tx.gateway_payment_id = request.gateway_payment_id.clone();
        }
        tx.failure_reason = request.failure_reason.clone();
        tx.settled_by = Some(request.source);
        tx.settled_at = Some(request.now);
        tx.updated_at = request.now;
        let transaction = tx.clone();

        let session = state
            .sessions
            .get_mut(&transaction.session_id)
            .ok_or_else(|| AppError::Internal(format!("missing session {}", transaction.session_id)))?;

        let mut release_slot = None;
        if session.status == SessionStatus::Pending {
            session.status = match request.status {
                PaymentStatus::Success => SessionStatus::Confirmed,
                _ => {
                    release_slot = Some(session.slot_id);
                    request.failed_session_status
                }
            };
        } else {
            tracing::error!(
                session_id = %session.id,
                status = %session.status,
                "settled a pending transaction on a session that was not pending"
            );
        }
        session.payment_status = request.status.into();
        session.updated_at = request.now;
        let session = session.clone();

        if let Some(slot_id) = release_slot {
            state.free_slot(slot_id, request.now);
        }
        Ok(SettlementResult::Applied { transaction, session })
    }

    async fn record_failed_attempt(
        &self,
        gateway_order_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let mut state = self.state.lock().await;
        let tx = state.transactions.iter_mut().find(|t| {
            t.kind == TransactionKind::Payment && t.gateway_order_id.as_deref() == Some(gateway_order_id)
        });
        Ok(tx.map(|tx| {
            if tx.status == PaymentStatus::Pending {
                tx.failure_reason = Some(reason.to_string());
                tx.updated_at = now;
            }
            tx.clone()
        }))
    }

    async fn record_refund(&self, record: &RefundRecord) -> Result<RefundOutcome, AppError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let payment = state
            .transactions
            .iter_mut()
            .find(|t| t.id == record.payment_id)
            .ok_or_else(|| AppError::NotFound(format!("payment {}", record.payment_id)))?;
        if payment.status != record.expected_status {
            return Ok(RefundOutcome::Conflict(payment.clone()));
        }
        payment.status = record.new_payment_status;
        payment.updated_at = record.now;
        let payment = payment.clone();

        state.transactions.push(record.refund.clone());

        let session = state
            .sessions
            .get_mut(&payment.session_id)
            .ok_or_else(|| AppError::Internal(format!("missing session {}", payment.session_id)))?;
        session.status = SessionStatus::Returned;
        session.payment_status = record.new_payment_status.into();
        session.updated_at = record.now;

        Ok(RefundOutcome::Recorded {
            payment,
            refund: record.refund.clone(),
            session: session.clone(),
        })
    }

    async fn transition_session(
        &self,
        session_id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, AppError> {
        reject_confirm_target(to)?;
        let mut state = self.state.lock().await;
        let session = match state.sessions.get_mut(&session_id) {
            Some(session) => session,
            None => return Ok(TransitionOutcome::NotFound),
        };
        if !from.contains(&session.status) {
            return Ok(TransitionOutcome::Rejected(session.clone()));
        }
        session.status = to;
        session.updated_at = now;
        Ok(TransitionOutcome::Applied(session.clone()))
    }

    async fn sessions_due_to_start(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Session>, AppError> {
        let state = self.state.lock().await;
        let mut due: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Confirmed && s.scheduled_start <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.scheduled_start, s.id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn sessions_due_to_complete(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Session>, AppError> {
        let state = self.state.lock().await;
        let mut due: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Ongoing && s.scheduled_end <= cutoff)
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.scheduled_end, s.id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn sessions_missing_meeting_link(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Session>, AppError> {
        let state = self.state.lock().await;
        let mut missing: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| {
                matches!(s.status, SessionStatus::Confirmed | SessionStatus::Ongoing)
                    && s.meeting_link.is_none()
                    && s.scheduled_end > now
            })
            .cloned()
            .collect();
        missing.sort_by_key(|s| (s.scheduled_start, s.id));
        missing.truncate(limit.max(0) as usize);
        Ok(missing)
    }

    async fn set_meeting_link(&self, session_id: Uuid, link: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;
        session.meeting_link = Some(link.to_string());
        session.updated_at = now;
        Ok(())
    }
}
