use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use consultbook_common::{
    AppError, PaymentStatus, SessionPaymentStatus, SessionStatus, SessionType,
};

use crate::models::{
    weekday_from_index, weekday_to_index, AvailabilitySlot, Client, Consultant,
    PaymentTransaction, Session, SlotKey, WeeklyAvailabilityPattern,
};
use crate::store::{
    reject_confirm_target, BookingStore, InsertTransactionOutcome, NewReservation, RefundOutcome,
    RefundRecord, ReleaseOutcome, ReleaseRequest, SettlementRequest, SettlementResult,
    TransitionOutcome,
};

// Database rows. Status columns are TEXT and parsed on the way out.

#[derive(Debug, FromRow)]
struct ConsultantRow {
    id: Uuid,
    slug: String,
    display_name: String,
    owner_user_id: Uuid,
    timezone: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ClientRow {
    id: Uuid,
    consultant_id: Uuid,
    name: String,
    email: String,
    phone: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct PatternRow {
    id: Uuid,
    consultant_id: Uuid,
    session_type: String,
    day_of_week: i16,
    start_time: NaiveTime,
    end_time: NaiveTime,
    slot_minutes: Option<i32>,
    timezone: String,
    is_active: bool,
}

#[derive(Debug, FromRow)]
struct SlotRow {
    id: Uuid,
    consultant_id: Uuid,
    session_type: String,
    slot_date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    is_booked: bool,
    is_blocked: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: Uuid,
    consultant_id: Uuid,
    client_id: Uuid,
    slot_id: Uuid,
    session_type: String,
    scheduled_date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    timezone: String,
    scheduled_start: DateTime<Utc>,
    scheduled_end: DateTime<Utc>,
    amount: Decimal,
    currency: String,
    status: String,
    payment_status: String,
    reservation_expires_at: DateTime<Utc>,
    meeting_link: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    session_id: Uuid,
    kind: String,
    parent_id: Option<Uuid>,
    amount: Decimal,
    currency: String,
    gateway_order_id: Option<String>,
    gateway_payment_id: Option<String>,
    gateway_refund_id: Option<String>,
    status: String,
    failure_reason: Option<String>,
    settled_by: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    settled_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<ConsultantRow> for Consultant {
    fn from(row: ConsultantRow) -> Self {
        Self {
            id: row.id,
            slug: row.slug,
            display_name: row.display_name,
            owner_user_id: row.owner_user_id,
            timezone: row.timezone,
            created_at: row.created_at,
        }
    }
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Self {
            id: row.id,
            consultant_id: row.consultant_id,
            name: row.name,
            email: row.email,
            phone: row.phone,
            created_at: row.created_at,
        }
    }
}

impl TryFrom<PatternRow> for WeeklyAvailabilityPattern {
    type Error = AppError;

    fn try_from(row: PatternRow) -> Result<Self, Self::Error> {
        let day_of_week = weekday_from_index(row.day_of_week)
            .ok_or_else(|| AppError::Internal(format!("bad day_of_week {} on pattern {}", row.day_of_week, row.id)))?;
        Ok(Self {
            id: row.id,
            consultant_id: row.consultant_id,
            session_type: row.session_type.parse()?,
            day_of_week,
            start_time: row.start_time,
            end_time: row.end_time,
            slot_minutes: row.slot_minutes,
            timezone: row.timezone,
            is_active: row.is_active,
        })
    }
}

impl TryFrom<SlotRow> for AvailabilitySlot {
    type Error = AppError;

    fn try_from(row: SlotRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            consultant_id: row.consultant_id,
            session_type: row.session_type.parse()?,
            slot_date: row.slot_date,
            start_time: row.start_time,
            end_time: row.end_time,
            is_booked: row.is_booked,
            is_blocked: row.is_blocked,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            consultant_id: row.consultant_id,
            client_id: row.client_id,
            slot_id: row.slot_id,
            session_type: row.session_type.parse()?,
            scheduled_date: row.scheduled_date,
            start_time: row.start_time,
            end_time: row.end_time,
            timezone: row.timezone,
            scheduled_start: row.scheduled_start,
            scheduled_end: row.scheduled_end,
            amount: row.amount,
            currency: row.currency,
            status: row.status.parse()?,
            payment_status: row.payment_status.parse()?,
            reservation_expires_at: row.reservation_expires_at,
            meeting_link: row.meeting_link,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<TransactionRow> for PaymentTransaction {
    type Error = AppError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            kind: row.kind.parse()?,
            parent_id: row.parent_id,
            amount: row.amount,
            currency: row.currency,
            gateway_order_id: row.gateway_order_id,
            gateway_payment_id: row.gateway_payment_id,
            gateway_refund_id: row.gateway_refund_id,
            status: row.status.parse()?,
            failure_reason: row.failure_reason,
            settled_by: row.settled_by.map(|s| s.parse()).transpose()?,
            expires_at: row.expires_at,
            created_at: row.created_at,
            settled_at: row.settled_at,
            updated_at: row.updated_at,
        })
    }
}

fn sessions_from_rows(rows: Vec<SessionRow>) -> Result<Vec<Session>, AppError> {
    rows.into_iter().map(Session::try_from).collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

const INSERT_TRANSACTION: &str = r#"
    INSERT INTO payment_transactions (
        id, session_id, kind, parent_id, amount, currency, gateway_order_id,
        gateway_payment_id, gateway_refund_id, status, failure_reason, settled_by,
        expires_at, created_at, settled_at, updated_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
    RETURNING *
"#;

fn bind_transaction<'q>(
    query: sqlx::query::QueryAs<'q, sqlx::Postgres, TransactionRow, sqlx::postgres::PgArguments>,
    tx: &'q PaymentTransaction,
) -> sqlx::query::QueryAs<'q, sqlx::Postgres, TransactionRow, sqlx::postgres::PgArguments> {
    query
        .bind(tx.id)
        .bind(tx.session_id)
        .bind(tx.kind.as_str())
        .bind(tx.parent_id)
        .bind(tx.amount)
        .bind(&tx.currency)
        .bind(tx.gateway_order_id.as_deref())
        .bind(tx.gateway_payment_id.as_deref())
        .bind(tx.gateway_refund_id.as_deref())
        .bind(tx.status.as_str())
        .bind(tx.failure_reason.as_deref())
        .bind(tx.settled_by.map(|s| s.as_str()))
        .bind(tx.expires_at)
        .bind(tx.created_at)
        .bind(tx.settled_at)
        .bind(tx.updated_at)
}

/// Postgres-backed store. Row locks are always taken session first, then
/// payment rows, then the slot, so concurrent settle/cancel/sweep calls
/// serialize instead of deadlocking.
#[derive(Clone)]
pub struct PgBookingStore {
    pool: PgPool,
}

impl PgBookingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn insert_consultant(&self, consultant: &Consultant) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO consultants (id, slug, display_name, owner_user_id, timezone, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(consultant.id)
        .bind(&consultant.slug)
        .bind(&consultant.display_name)
        .bind(consultant.owner_user_id)
        .bind(&consultant.timezone)
        .bind(consultant.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(format!("consultant slug {} is taken", consultant.slug))
            } else {
                AppError::Database(e)
            }
        })?;
        Ok(())
    }

    async fn get_consultant(&self, consultant_id: Uuid) -> Result<Option<Consultant>, AppError> {
        let row = sqlx::query_as::<_, ConsultantRow>("SELECT * FROM consultants WHERE id = $1")
            .bind(consultant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Consultant::from))
    }

    async fn insert_pattern(&self, pattern: &WeeklyAvailabilityPattern) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO weekly_availability_patterns (
                id, consultant_id, session_type, day_of_week, start_time, end_time,
                slot_minutes, timezone, is_active
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(pattern.id)
        .bind(pattern.consultant_id)
        .bind(pattern.session_type.as_str())
        .bind(weekday_to_index(pattern.day_of_week))
        .bind(pattern.start_time)
        .bind(pattern.end_time)
        .bind(pattern.slot_minutes)
        .bind(&pattern.timezone)
        .bind(pattern.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active_patterns(
        &self,
        consultant_id: Uuid,
        session_type: SessionType,
    ) -> Result<Vec<WeeklyAvailabilityPattern>, AppError> {
        let rows = sqlx::query_as::<_, PatternRow>(
            r#"
            SELECT id, consultant_id, session_type, day_of_week, start_time, end_time,
                   slot_minutes, timezone, is_active
            FROM weekly_availability_patterns
            WHERE consultant_id = $1 AND session_type = $2 AND is_active
            ORDER BY day_of_week, start_time, id
            "#,
        )
        .bind(consultant_id)
        .bind(session_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WeeklyAvailabilityPattern::try_from).collect()
    }

    async fn insert_slot(&self, slot: &AvailabilitySlot) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO availability_slots (
                id, consultant_id, session_type, slot_date, start_time, end_time,
                is_booked, is_blocked, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(slot.id)
        .bind(slot.consultant_id)
        .bind(slot.session_type.as_str())
        .bind(slot.slot_date)
        .bind(slot.start_time)
        .bind(slot.end_time)
        .bind(slot.is_booked)
        .bind(slot.is_blocked)
        .bind(slot.created_at)
        .bind(slot.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict("slot already exists".to_string())
            } else {
                AppError::Database(e)
            }
        })?;
        Ok(())
    }

    async fn list_slots(
        &self,
        consultant_id: Uuid,
        session_type: SessionType,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AvailabilitySlot>, AppError> {
        let rows = sqlx::query_as::<_, SlotRow>(
            r#"
            SELECT * FROM availability_slots
            WHERE consultant_id = $1 AND session_type = $2
              AND slot_date BETWEEN $3 AND $4
            ORDER BY slot_date, start_time
            "#,
        )
        .bind(consultant_id)
        .bind(session_type.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AvailabilitySlot::try_from).collect()
    }

    async fn upsert_client(
        &self,
        consultant_id: Uuid,
        name: &str,
        email: &str,
        phone: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Client, AppError> {
        let row = sqlx::query_as::<_, ClientRow>(
            r#"
            INSERT INTO clients (id, consultant_id, name, email, phone, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (consultant_id, email) DO UPDATE
                SET name = EXCLUDED.name,
                    phone = COALESCE(EXCLUDED.phone, clients.phone)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(consultant_id)
        .bind(name)
        .bind(email.trim().to_lowercase())
        .bind(phone)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_client(&self, client_id: Uuid) -> Result<Option<Client>, AppError> {
        let row = sqlx::query_as::<_, ClientRow>("SELECT * FROM clients WHERE id = $1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Client::from))
    }

    async fn reserve_slot(&self, r: &NewReservation) -> Result<Option<Session>, AppError> {
        let mut tx = self.pool.begin().await?;

        // Existing row: conditional flip. A concurrent claimer blocks on the
        // row lock and then sees is_booked = TRUE.
        let claimed = sqlx::query_as::<_, SlotRow>(
            r#"
            UPDATE availability_slots
            SET is_booked = TRUE, updated_at = $5
            WHERE consultant_id = $1 AND session_type = $2 AND slot_date = $3 AND start_time = $4
              AND NOT is_booked AND NOT is_blocked
            RETURNING *
            "#,
        )
        .bind(r.key.consultant_id)
        .bind(r.key.session_type.as_str())
        .bind(r.key.date)
        .bind(r.key.start_time)
        .bind(r.now)
        .fetch_optional(&mut *tx)
        .await?;

        let slot = match claimed {
            Some(slot) => slot,
            None => {
                // Missing row: insert-or-fail on the unique key.
                let inserted = sqlx::query_as::<_, SlotRow>(
                    r#"
                    INSERT INTO availability_slots (
                        id, consultant_id, session_type, slot_date, start_time, end_time,
                        is_booked, is_blocked, created_at, updated_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, TRUE, FALSE, $7, $7)
                    ON CONFLICT (consultant_id, session_type, slot_date, start_time) DO NOTHING
                    RETURNING *
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(r.key.consultant_id)
                .bind(r.key.session_type.as_str())
                .bind(r.key.date)
                .bind(r.key.start_time)
                .bind(r.end_time)
                .bind(r.now)
                .fetch_optional(&mut *tx)
                .await?;

                match inserted {
                    Some(slot) => slot,
                    None => {
                        tx.rollback().await?;
                        return Ok(None);
                    }
                }
            }
        };

        let inserted = sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO sessions (
                id, consultant_id, client_id, slot_id, session_type, scheduled_date,
                start_time, end_time, timezone, scheduled_start, scheduled_end, amount,
                currency, status, payment_status, reservation_expires_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $17)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(r.key.consultant_id)
        .bind(r.client_id)
        .bind(slot.id)
        .bind(r.key.session_type.as_str())
        .bind(r.key.date)
        .bind(r.key.start_time)
        .bind(slot.end_time)
        .bind(&r.timezone)
        .bind(r.scheduled_start)
        .bind(r.scheduled_end)
        .bind(r.amount)
        .bind(&r.currency)
        .bind(SessionStatus::Pending.as_str())
        .bind(SessionPaymentStatus::Unpaid.as_str())
        .bind(r.reservation_expires_at)
        .bind(r.now)
        .fetch_one(&mut *tx)
        .await;

        let row = match inserted {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                tracing::warn!(slot_id = %slot.id, "slot flagged free while another session still holds it");
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        tx.commit().await?;
        Ok(Some(row.try_into()?))
    }

    async fn session_holding_slot(&self, key: &SlotKey) -> Result<Option<Session>, AppError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT s.* FROM sessions s
            JOIN availability_slots a ON a.id = s.slot_id
            WHERE a.consultant_id = $1 AND a.session_type = $2 AND a.slot_date = $3 AND a.start_time = $4
              AND s.status NOT IN ('CANCELLED', 'ABANDONED')
            ORDER BY s.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(key.consultant_id)
        .bind(key.session_type.as_str())
        .bind(key.date)
        .bind(key.start_time)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Session::try_from).transpose()
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, AppError> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Session::try_from).transpose()
    }

    async fn list_expired_pending_sessions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Session>, AppError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM sessions
            WHERE status = 'PENDING' AND reservation_expires_at <= $1
            ORDER BY reconciliation_deferred_at NULLS FIRST, reservation_expires_at, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        sessions_from_rows(rows)
    }

    async fn defer_reconciliation(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE sessions SET reconciliation_deferred_at = $2 WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(session_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_pending_session(&self, request: &ReleaseRequest) -> Result<ReleaseOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = $1 FOR UPDATE")
            .bind(request.session_id)
            .fetch_optional(&mut *tx)
            .await?;
        let session = match row {
            Some(row) => Session::try_from(row)?,
            None => {
                tx.rollback().await?;
                return Ok(ReleaseOutcome::NotFound);
            }
        };

        let not_expired = request
            .expired_by
            .map_or(false, |cutoff| session.reservation_expires_at > cutoff);
        if session.status != SessionStatus::Pending || not_expired {
            tx.rollback().await?;
            return Ok(ReleaseOutcome::NotReleasable(session));
        }

        let failed = sqlx::query(
            r#"
            UPDATE payment_transactions
            SET status = 'FAILED', failure_reason = $2, settled_by = $3, settled_at = $4, updated_at = $4
            WHERE session_id = $1 AND kind = 'PAYMENT' AND status = 'PENDING'
            "#,
        )
        .bind(request.session_id)
        .bind(&request.reason)
        .bind(request.source.as_str())
        .bind(request.now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let payment_status = if failed > 0 {
            SessionPaymentStatus::Failed
        } else {
            session.payment_status
        };

        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE sessions SET status = $2, payment_status = $3, updated_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(request.session_id)
        .bind(request.status.as_str())
        .bind(payment_status.as_str())
        .bind(request.now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE availability_slots SET is_booked = FALSE, updated_at = $2 WHERE id = $1")
            .bind(session.slot_id)
            .bind(request.now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(ReleaseOutcome::Released(row.try_into()?))
    }

    async fn pending_transaction_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM payment_transactions
            WHERE session_id = $1 AND kind = 'PAYMENT' AND status = 'PENDING'
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn insert_pending_transaction(
        &self,
        transaction: &PaymentTransaction,
        now: DateTime<Utc>,
    ) -> Result<InsertTransactionOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let session: Session = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = $1 FOR UPDATE")
            .bind(transaction.session_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {}", transaction.session_id)))?
            .try_into()?;

        if session.status != SessionStatus::Pending || session.reservation_expired(now) {
            tx.rollback().await?;
            return Ok(InsertTransactionOutcome::SessionNotPending(session));
        }

        let existing = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT * FROM payment_transactions
            WHERE session_id = $1 AND kind = 'PAYMENT' AND status = 'PENDING'
            "#,
        )
        .bind(transaction.session_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(existing) = existing {
            tx.rollback().await?;
            return Ok(InsertTransactionOutcome::Existing(existing.try_into()?));
        }

        let row = bind_transaction(sqlx::query_as::<_, TransactionRow>(INSERT_TRANSACTION), transaction)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict("gateway order already recorded".to_string())
                } else {
                    AppError::Database(e)
                }
            })?;

        tx.commit().await?;
        Ok(InsertTransactionOutcome::Inserted(row.try_into()?))
    }

    async fn find_transaction_by_order(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM payment_transactions WHERE gateway_order_id = $1 AND kind = 'PAYMENT'",
        )
        .bind(gateway_order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn transactions_for_session(&self, session_id: Uuid) -> Result<Vec<PaymentTransaction>, AppError> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM payment_transactions WHERE session_id = $1 ORDER BY created_at, id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PaymentTransaction::try_from).collect()
    }

    async fn settle_transaction(&self, request: &SettlementRequest) -> Result<SettlementResult, AppError> {
        if !matches!(request.status, PaymentStatus::Success | PaymentStatus::Failed) {
            return Err(AppError::Validation("settlement must be SUCCESS or FAILED".to_string()));
        }

        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT s.* FROM sessions s
            JOIN payment_transactions t ON t.session_id = s.id
            WHERE t.gateway_order_id = $1 AND t.kind = 'PAYMENT'
            FOR UPDATE OF s
            "#,
        )
        .bind(&request.gateway_order_id)
        .fetch_optional(&mut *tx)
        .await?;
        let session = match locked {
            Some(row) => Session::try_from(row)?,
            None => {
                tx.rollback().await?;
                return Ok(SettlementResult::UnknownOrder);
            }
        };

        let settled = sqlx::query_as::<_, TransactionRow>(
            r#"
            UPDATE payment_transactions
            SET status = $2,
                gateway_payment_id = COALESCE($3, gateway_payment_id),
                failure_reason = $4,
                settled_by = $5,
                settled_at = $6,
                updated_at = $6
            WHERE gateway_order_id = $1 AND kind = 'PAYMENT' AND status = 'PENDING'
            RETURNING *
            "#,
        )
        .bind(&request.gateway_order_id)
        .bind(request.status.as_str())
        .bind(request.gateway_payment_id.as_deref())
        .bind(request.failure_reason.as_deref())
        .bind(request.source.as_str())
        .bind(request.now)
        .fetch_optional(&mut *tx)
        .await?;

        let transaction: PaymentTransaction = match settled {
            Some(row) => row.try_into()?,
            None => {
                let current = sqlx::query_as::<_, TransactionRow>(
                    "SELECT * FROM payment_transactions WHERE gateway_order_id = $1 AND kind = 'PAYMENT'",
                )
                .bind(&request.gateway_order_id)
                .fetch_one(&mut *tx)
                .await?;
                tx.commit().await?;
                return Ok(SettlementResult::AlreadySettled {
                    transaction: current.try_into()?,
                    session,
                });
            }
        };

        let mut release_slot = false;
        let next_status = if session.status == SessionStatus::Pending {
            match request.status {
                PaymentStatus::Success => SessionStatus::Confirmed,
                _ => {
                    release_slot = true;
                    request.failed_session_status
                }
            }
        } else {
            tracing::error!(
                session_id = %session.id,
                status = %session.status,
                "settled a pending transaction on a session that was not pending"
            );
            session.status
        };
        let payment_status: SessionPaymentStatus = request.status.into();

        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE sessions SET status = $2, payment_status = $3, updated_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(session.id)
        .bind(next_status.as_str())
        .bind(payment_status.as_str())
        .bind(request.now)
        .fetch_one(&mut *tx)
        .await?;

        if release_slot {
            sqlx::query("UPDATE availability_slots SET is_booked = FALSE, updated_at = $2 WHERE id = $1")
                .bind(session.slot_id)
                .bind(request.now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(SettlementResult::Applied {
            transaction,
            session: row.try_into()?,
        })
    }

    async fn record_failed_attempt(
        &self,
        gateway_order_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let noted = sqlx::query_as::<_, TransactionRow>(
            r#"
            UPDATE payment_transactions SET failure_reason = $2, updated_at = $3
            WHERE gateway_order_id = $1 AND kind = 'PAYMENT' AND status = 'PENDING'
            RETURNING *
            "#,
        )
        .bind(gateway_order_id)
        .bind(reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match noted {
            Some(row) => Ok(Some(row.try_into()?)),
            None => self.find_transaction_by_order(gateway_order_id).await,
        }
    }

    async fn record_refund(&self, record: &RefundRecord) -> Result<RefundOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            SELECT s.id FROM sessions s
            JOIN payment_transactions t ON t.session_id = s.id
            WHERE t.id = $1
            FOR UPDATE OF s
            "#,
        )
        .bind(record.payment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("payment {}", record.payment_id)))?;

        let updated = sqlx::query_as::<_, TransactionRow>(
            r#"
            UPDATE payment_transactions SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(record.payment_id)
        .bind(record.expected_status.as_str())
        .bind(record.new_payment_status.as_str())
        .bind(record.now)
        .fetch_optional(&mut *tx)
        .await?;

        let payment: PaymentTransaction = match updated {
            Some(row) => row.try_into()?,
            None => {
                let current = sqlx::query_as::<_, TransactionRow>("SELECT * FROM payment_transactions WHERE id = $1")
                    .bind(record.payment_id)
                    .fetch_one(&mut *tx)
                    .await?;
                tx.rollback().await?;
                return Ok(RefundOutcome::Conflict(current.try_into()?));
            }
        };

        let refund: PaymentTransaction =
            bind_transaction(sqlx::query_as::<_, TransactionRow>(INSERT_TRANSACTION), &record.refund)
                .fetch_one(&mut *tx)
                .await?
                .try_into()?;

        let payment_status: SessionPaymentStatus = record.new_payment_status.into();
        let session = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE sessions SET status = $2, payment_status = $3, updated_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(payment.session_id)
        .bind(SessionStatus::Returned.as_str())
        .bind(payment_status.as_str())
        .bind(record.now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RefundOutcome::Recorded {
            payment,
            refund,
            session: session.try_into()?,
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
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let updated = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE sessions SET status = $2, updated_at = $3
            WHERE id = $1 AND status = ANY($4)
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(to.as_str())
        .bind(now)
        .bind(&from)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(TransitionOutcome::Applied(row.try_into()?));
        }
        match self.get_session(session_id).await? {
            Some(session) => Ok(TransitionOutcome::Rejected(session)),
            None => Ok(TransitionOutcome::NotFound),
        }
    }

    async fn sessions_due_to_start(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Session>, AppError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM sessions
            WHERE status = 'CONFIRMED' AND scheduled_start <= $1
            ORDER BY scheduled_start, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        sessions_from_rows(rows)
    }

    async fn sessions_due_to_complete(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Session>, AppError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM sessions
            WHERE status = 'ONGOING' AND scheduled_end <= $1
            ORDER BY scheduled_end, id
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        sessions_from_rows(rows)
    }

    async fn sessions_missing_meeting_link(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Session>, AppError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM sessions
            WHERE status IN ('CONFIRMED', 'ONGOING') AND meeting_link IS NULL AND scheduled_end > $1
            ORDER BY scheduled_start, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        sessions_from_rows(rows)
    }

    async fn set_meeting_link(&self, session_id: Uuid, link: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE sessions SET meeting_link = $2, updated_at = $3 WHERE id = $1")
            .bind(session_id)
            .bind(link)
            .bind(now)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {}", session_id)));
        }
        Ok(())
    }
}
