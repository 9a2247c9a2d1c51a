use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use consultbook_common::{bounded_call, AppError, PaymentStatus, SessionPaymentStatus, SessionStatus, TransactionKind};
use consultbook_database::{BookingStore, InsertTransactionOutcome, PaymentTransaction, Session};

use crate::config::GatewayDeadlines;
use crate::error::BookingError;
use crate::gateways::{to_minor_units, CheckoutConfig, CreateOrderRequest, PaymentGateway, OP_CREATE_ORDER};

/// What the browser needs to open checkout for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHandle {
    pub session_id: Uuid,
    pub transaction_id: Uuid,
    pub order_id: String,
    pub amount: Decimal,
    pub amount_minor: i64,
    pub currency: String,
    pub key_id: String,
    pub merchant_name: String,
    pub expires_at: DateTime<Utc>,
    /// True when an existing PENDING order was returned.
    pub reused: bool,
}

impl OrderHandle {
    fn new(session: &Session, transaction: &PaymentTransaction, checkout: &CheckoutConfig, reused: bool) -> Result<Self, BookingError> {
        let order_id = transaction
            .gateway_order_id
            .clone()
            .ok_or_else(|| AppError::Internal(format!("payment {} has no gateway order", transaction.id)))?;
        Ok(Self {
            session_id: session.id,
            transaction_id: transaction.id,
            order_id,
            amount: transaction.amount,
            amount_minor: minor_units(transaction.amount)?,
            currency: transaction.currency.clone(),
            key_id: checkout.key_id.clone(),
            merchant_name: checkout.merchant_name.clone(),
            expires_at: session.reservation_expires_at,
            reused,
        })
    }
}

fn minor_units(amount: Decimal) -> Result<i64, AppError> {
    to_minor_units(amount.normalize())
        .ok_or_else(|| AppError::Validation(format!("amount {} cannot be charged", amount)))
}

pub struct OrderCoordinator {
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn PaymentGateway>,
    deadlines: GatewayDeadlines,
}

impl OrderCoordinator {
    pub fn new(store: Arc<dyn BookingStore>, gateway: Arc<dyn PaymentGateway>, deadlines: GatewayDeadlines) -> Self {
        Self {
            store,
            gateway,
            deadlines,
        }
    }

    /// Returns the PENDING order of the session, creating it at the gateway
    /// when there is none. Safe to call again after a timeout or a page
    /// refresh: at most one PENDING order exists per session.
    pub async fn create_order(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<OrderHandle, BookingError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;
        ensure_payable(&session, now)?;

        let checkout = self.gateway.checkout_config();

        if let Some(existing) = self.store.pending_transaction_for_session(session.id).await? {
            tracing::debug!(session_id = %session.id, transaction_id = %existing.id, "Reusing pending order");
            return OrderHandle::new(&session, &existing, &checkout, true);
        }

        let amount_minor = minor_units(session.amount)?;
        let mut notes = HashMap::new();
        notes.insert("session_id".to_string(), session.id.to_string());
        notes.insert("consultant_id".to_string(), session.consultant_id.to_string());
        if let Some(client) = self.store.get_client(session.client_id).await? {
            notes.insert("client_email".to_string(), client.email);
        }
        let request = CreateOrderRequest {
            amount_minor,
            currency: session.currency.clone(),
            receipt: session.id.simple().to_string(),
            notes,
        };

        let order = bounded_call(OP_CREATE_ORDER, self.deadlines.create_order(), self.gateway.create_order(&request)).await?;
        if order.amount_minor != amount_minor || !order.currency.eq_ignore_ascii_case(&session.currency) {
            return Err(BookingError::GatewayRejected(format!(
                "order {} was created for {} {} instead of {} {}",
                order.order_id, order.amount_minor, order.currency, amount_minor, session.currency
            )));
        }

        let transaction = PaymentTransaction {
            id: Uuid::new_v4(),
            session_id: session.id,
            kind: TransactionKind::Payment,
            parent_id: None,
            amount: session.amount,
            currency: session.currency.clone(),
            gateway_order_id: Some(order.order_id.clone()),
            gateway_payment_id: None,
            gateway_refund_id: None,
            status: PaymentStatus::Pending,
            failure_reason: None,
            settled_by: None,
            expires_at: Some(session.reservation_expires_at),
            created_at: now,
            settled_at: None,
            updated_at: now,
        };

        match self.store.insert_pending_transaction(&transaction, now).await? {
            InsertTransactionOutcome::Inserted(transaction) => {
                tracing::info!(
                    session_id = %session.id,
                    order_id = %order.order_id,
                    amount_minor,
                    "Payment order created"
                );
                OrderHandle::new(&session, &transaction, &checkout, false)
            }
            InsertTransactionOutcome::Existing(existing) => {
                // A concurrent call won; its order is the one the client pays.
                tracing::warn!(
                    session_id = %session.id,
                    discarded_order_id = %order.order_id,
                    "Concurrent order creation, keeping the first order"
                );
                OrderHandle::new(&session, &existing, &checkout, true)
            }
            InsertTransactionOutcome::SessionNotPending(current) => {
                tracing::info!(
                    session_id = %current.id,
                    status = %current.status,
                    orphan_order_id = %order.order_id,
                    "Session left PENDING while the order was being created"
                );
                Err(BookingError::ReservationExpired)
            }
        }
    }
}

fn ensure_payable(session: &Session, now: DateTime<Utc>) -> Result<(), BookingError> {
    if session.status == SessionStatus::Pending && !session.reservation_expired(now) {
        return Ok(());
    }
    if session.payment_status == SessionPaymentStatus::Paid {
        return Err(AppError::Conflict(format!("session {} is already paid", session.id)).into());
    }
    Err(BookingError::ReservationExpired)
}
