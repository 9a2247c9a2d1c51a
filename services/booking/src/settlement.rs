//! Payment verification and reconciliation.
//!
//! Three signals can report the outcome of one gateway order: the browser's
//! verification call, the gateway webhook and the reconciliation poll. All
//! of them end in [`BookingStore::settle_transaction`], a compare-and-set on
//! the PENDING transaction. The caller that wins runs the side effects; all
//! others get [`SettlementOutcome::AlreadySettled`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use consultbook_common::{
    bounded_call, AppError, PaymentStatus, RemoteCallError, SessionStatus, SettlementSource,
    TransactionKind,
};
use consultbook_database::{
    BookingStore, PaymentTransaction, RefundOutcome, RefundRecord, ReleaseOutcome, ReleaseRequest,
    Session, SettlementRequest, SettlementResult,
};

use crate::collaborators::{NotificationType, SessionEffects};
use crate::config::{BookingRules, GatewayDeadlines};
use crate::error::BookingError;
use crate::gateways::{
    to_minor_units, GatewayOrderStatus, PaymentGateway, OP_FETCH_ORDER_STATUS, OP_REFUND,
};
use crate::session_state;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementOutcome {
    /// This call performed the settlement.
    Settled {
        session_id: Uuid,
        session_status: SessionStatus,
        payment_status: PaymentStatus,
    },
    /// Another signal settled first; nothing was changed.
    AlreadySettled {
        session_id: Uuid,
        session_status: SessionStatus,
        payment_status: PaymentStatus,
    },
    /// The gateway has no final answer yet.
    Pending { order_id: String },
    /// Webhook event that does not affect settlement.
    Ignored { event: String },
    UnknownOrder { order_id: String },
}

/// What the expiry path did with one PENDING session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryOutcome {
    /// The session reached this status.
    Resolved(SessionStatus),
    /// Gateway status unknown; retried on the next run.
    Deferred,
    /// The session had already moved on.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub session_id: Uuid,
    pub refund_id: Uuid,
    pub gateway_refund_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub payment_status: PaymentStatus,
    pub session_status: SessionStatus,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event: String,
    #[serde(default)]
    payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    payment: Option<Entity<WebhookPayment>>,
    order: Option<Entity<WebhookOrder>>,
}

#[derive(Debug, Deserialize)]
struct Entity<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct WebhookPayment {
    id: String,
    order_id: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookOrder {
    id: String,
}

pub struct SettlementService {
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn PaymentGateway>,
    effects: Arc<SessionEffects>,
    deadlines: GatewayDeadlines,
    rules: BookingRules,
}

impl SettlementService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        effects: Arc<SessionEffects>,
        deadlines: GatewayDeadlines,
        rules: BookingRules,
    ) -> Self {
        Self {
            store,
            gateway,
            effects,
            deadlines,
            rules,
        }
    }

    /// Browser return from checkout. The signature covers
    /// `"{order_id}|{payment_id}"` under the key secret.
    pub async fn verify_payment(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, BookingError> {
        if !self.gateway.verify_payment_signature(order_id, payment_id, signature) {
            tracing::warn!(
                target: "security",
                order_id = %order_id,
                payment_id = %payment_id,
                "Payment verification signature mismatch"
            );
            return Err(BookingError::InvalidSignature);
        }

        let outcome = self
            .apply(SettlementRequest {
                gateway_order_id: order_id.to_string(),
                status: PaymentStatus::Success,
                gateway_payment_id: Some(payment_id.to_string()),
                failure_reason: None,
                source: SettlementSource::ClientVerification,
                failed_session_status: SessionStatus::Cancelled,
                now,
            })
            .await?;

        if let SettlementOutcome::UnknownOrder { order_id } = outcome {
            return Err(AppError::NotFound(format!("payment order {}", order_id)).into());
        }
        Ok(outcome)
    }

    /// Gateway push. The signature header is an HMAC of the raw body under
    /// the webhook secret and is checked before the body is parsed.
    pub async fn handle_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, BookingError> {
        let verified = signature
            .map(|sig| self.gateway.verify_webhook_signature(body, sig))
            .unwrap_or(false);
        if !verified {
            tracing::warn!(
                target: "security",
                signature_present = signature.is_some(),
                body_len = body.len(),
                "Webhook signature rejected"
            );
            return Err(BookingError::InvalidSignature);
        }

        let envelope: WebhookEnvelope = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("malformed webhook payload: {}", e)))?;
        let payment = envelope.payload.payment.map(|p| p.entity);
        let order_id = payment
            .as_ref()
            .and_then(|p| p.order_id.clone())
            .or_else(|| envelope.payload.order.map(|o| o.entity.id));

        let failed = match envelope.event.as_str() {
            "payment.captured" | "order.paid" => false,
            "payment.failed" => true,
            other => {
                tracing::debug!(event = %other, "Ignoring webhook event");
                return Ok(SettlementOutcome::Ignored {
                    event: other.to_string(),
                });
            }
        };

        let order_id = order_id
            .ok_or_else(|| AppError::Validation(format!("{} event without an order id", envelope.event)))?;

        if failed {
            let reason = payment
                .and_then(|p| p.error_description)
                .unwrap_or_else(|| "payment failed".to_string());
            return self.note_failed_attempt(&order_id, &reason, now).await;
        }

        self.apply(SettlementRequest {
            gateway_order_id: order_id,
            status: PaymentStatus::Success,
            gateway_payment_id: payment.map(|p| p.id),
            failure_reason: None,
            source: SettlementSource::Webhook,
            failed_session_status: SessionStatus::Cancelled,
            now,
        })
        .await
    }

    /// A failed attempt does not close the order: the client may pay again
    /// on it while the hold lasts, so the slot stays held until the expiry
    /// sweep asks the gateway for the final word.
    async fn note_failed_attempt(
        &self,
        order_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, BookingError> {
        let Some(transaction) = self.store.record_failed_attempt(order_id, reason, now).await? else {
            tracing::warn!(order_id = %order_id, "Failed payment for unknown order");
            return Ok(SettlementOutcome::UnknownOrder {
                order_id: order_id.to_string(),
            });
        };

        if !transaction.status.is_pending() {
            let session = self.session(transaction.session_id).await?;
            tracing::info!(
                order_id = %order_id,
                payment_status = %transaction.status,
                "Failed attempt arrived after settlement"
            );
            return Ok(SettlementOutcome::AlreadySettled {
                session_id: session.id,
                session_status: session.status,
                payment_status: transaction.status,
            });
        }

        tracing::info!(order_id = %order_id, reason = %reason, "Payment attempt failed, order stays open");
        Ok(SettlementOutcome::Pending {
            order_id: order_id.to_string(),
        })
    }

    /// Asks the gateway about one order and settles it when the answer is
    /// final. A timeout is reported, never retried here.
    pub async fn reconcile_order(&self, order_id: &str, now: DateTime<Utc>) -> Result<SettlementOutcome, BookingError> {
        let transaction = self
            .store
            .find_transaction_by_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment order {}", order_id)))?;

        if !transaction.status.is_pending() {
            let session = self.session(transaction.session_id).await?;
            return Ok(SettlementOutcome::AlreadySettled {
                session_id: session.id,
                session_status: session.status,
                payment_status: transaction.status,
            });
        }

        let status = bounded_call(
            OP_FETCH_ORDER_STATUS,
            self.deadlines.status(),
            self.gateway.fetch_order_status(order_id),
        )
        .await?;

        let expired = transaction.expires_at.map_or(false, |at| at <= now);
        match status {
            GatewayOrderStatus::Paid { payment_id } => {
                self.apply(reconciled(order_id, PaymentStatus::Success, Some(payment_id), None, SessionStatus::Cancelled, now))
                    .await
            }
            GatewayOrderStatus::Attempted { reason } if expired => {
                let reason = attempt_reason(reason, &transaction);
                self.apply(reconciled(order_id, PaymentStatus::Failed, None, Some(reason), SessionStatus::Cancelled, now))
                    .await
            }
            _ => Ok(SettlementOutcome::Pending {
                order_id: order_id.to_string(),
            }),
        }
    }

    /// Resolves a PENDING session whose reservation has expired. Without a
    /// payment order the slot is released at once; with one, the gateway is
    /// asked first so a payment made just before expiry still confirms.
    pub async fn expire_session(&self, session: &Session, now: DateTime<Utc>) -> Result<ExpiryOutcome, BookingError> {
        if session.status != SessionStatus::Pending || !session.reservation_expired(now) {
            return Ok(ExpiryOutcome::Skipped);
        }

        let pending = self.store.pending_transaction_for_session(session.id).await?;
        let Some((transaction, order_id)) = pending.and_then(|tx| {
            let order_id = tx.gateway_order_id.clone()?;
            Some((tx, order_id))
        }) else {
            return self
                .release(session.id, "reservation expired", SettlementSource::Expiry, now)
                .await;
        };

        let status = bounded_call(
            OP_FETCH_ORDER_STATUS,
            self.deadlines.status(),
            self.gateway.fetch_order_status(&order_id),
        )
        .await;

        let outcome = match status {
            Ok(GatewayOrderStatus::Paid { payment_id }) => {
                self.apply(reconciled(&order_id, PaymentStatus::Success, Some(payment_id), None, SessionStatus::Cancelled, now))
                    .await?
            }
            Ok(GatewayOrderStatus::Attempted { reason }) => {
                let reason = attempt_reason(reason, &transaction);
                self.apply(reconciled(&order_id, PaymentStatus::Failed, None, Some(reason), SessionStatus::Cancelled, now))
                    .await?
            }
            Ok(GatewayOrderStatus::Created) => {
                self.apply(reconciled(
                    &order_id,
                    PaymentStatus::Failed,
                    None,
                    Some("reservation expired before payment".to_string()),
                    SessionStatus::Abandoned,
                    now,
                ))
                .await?
            }
            Ok(GatewayOrderStatus::InProgress) | Err(_) => {
                let give_up_at = session.reservation_expires_at + self.rules.reconciliation_grace();
                if now < give_up_at {
                    match &status {
                        Err(e) => tracing::warn!(session_id = %session.id, order_id = %order_id, error = %e, "Reconciliation deferred"),
                        Ok(_) => tracing::info!(session_id = %session.id, order_id = %order_id, "Payment still in progress, deferring"),
                    }
                    self.store.defer_reconciliation(session.id, now).await?;
                    return Ok(ExpiryOutcome::Deferred);
                }
                tracing::error!(
                    target: "operator",
                    session_id = %session.id,
                    order_id = %order_id,
                    timed_out = matches!(&status, Err(RemoteCallError::Timeout { .. })),
                    "Reconciliation window exceeded without a final gateway status; abandoning reservation"
                );
                return self
                    .release(session.id, "reconciliation window exceeded", SettlementSource::Reconciliation, now)
                    .await;
            }
        };

        Ok(match outcome {
            SettlementOutcome::Settled { session_status, .. } => ExpiryOutcome::Resolved(session_status),
            _ => ExpiryOutcome::Skipped,
        })
    }

    /// Refunds all or part of the settled payment of a session. The gateway
    /// is called first; the ledger records the refund only once it succeeded.
    pub async fn refund_session(
        &self,
        session_id: Uuid,
        amount: Option<Decimal>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RefundReceipt, BookingError> {
        let session = self.session(session_id).await?;
        let transactions = self.store.transactions_for_session(session_id).await?;

        let payment = transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::Payment)
            .find(|t| matches!(t.status, PaymentStatus::Success | PaymentStatus::PartiallyRefunded))
            .cloned()
            .ok_or(BookingError::InvalidTransition {
                from: session.status,
                to: SessionStatus::Returned,
            })?;

        let further_partial = session.status == SessionStatus::Returned
            && payment.status == PaymentStatus::PartiallyRefunded;
        if !further_partial {
            session_state::ensure_transition(session.status, SessionStatus::Returned)?;
        }

        let refunded: Decimal = transactions
            .iter()
            .filter(|t| {
                t.kind == TransactionKind::Refund
                    && t.parent_id == Some(payment.id)
                    && t.status == PaymentStatus::Success
            })
            .map(|t| t.amount)
            .sum();
        let remaining = payment.amount - refunded;
        let amount = amount.unwrap_or(remaining);

        if amount <= Decimal::ZERO || amount > remaining {
            return Err(AppError::Validation(format!(
                "refund amount must be between 0 and {} {}",
                remaining, payment.currency
            ))
            .into());
        }
        let amount_minor = to_minor_units(amount)
            .ok_or_else(|| AppError::Validation("refund amount has more than two decimals".to_string()))?;
        let gateway_payment_id = payment
            .gateway_payment_id
            .clone()
            .ok_or_else(|| AppError::Internal(format!("settled payment {} has no gateway payment id", payment.id)))?;

        let mut notes = HashMap::new();
        notes.insert("session_id".to_string(), session_id.to_string());
        if let Some(reason) = &reason {
            notes.insert("reason".to_string(), reason.clone());
        }

        let refund = match bounded_call(
            OP_REFUND,
            self.deadlines.refund(),
            self.gateway.refund_payment(&gateway_payment_id, amount_minor, notes),
        )
        .await
        {
            Ok(refund) => refund,
            Err(RemoteCallError::Timeout { operation, after_ms }) => {
                tracing::error!(
                    target: "operator",
                    session_id = %session_id,
                    payment_id = %gateway_payment_id,
                    after_ms,
                    "Refund timed out; gateway state unknown, check before retrying"
                );
                return Err(BookingError::GatewayTimeout { operation });
            }
            Err(RemoteCallError::Failed(e)) => {
                tracing::error!(
                    target: "operator",
                    session_id = %session_id,
                    payment_id = %gateway_payment_id,
                    error = %e,
                    "Refund rejected by gateway"
                );
                return Err(BookingError::RefundFailed(e.to_string()));
            }
        };

        let new_payment_status = if refunded + amount >= payment.amount {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
        let refund_row = PaymentTransaction {
            id: Uuid::new_v4(),
            session_id,
            kind: TransactionKind::Refund,
            parent_id: Some(payment.id),
            amount,
            currency: payment.currency.clone(),
            gateway_order_id: None,
            gateway_payment_id: Some(gateway_payment_id),
            gateway_refund_id: Some(refund.refund_id),
            status: PaymentStatus::Success,
            failure_reason: None,
            settled_by: None,
            expires_at: None,
            created_at: now,
            settled_at: Some(now),
            updated_at: now,
        };

        let record = RefundRecord {
            payment_id: payment.id,
            expected_status: payment.status,
            new_payment_status,
            refund: refund_row,
            now,
        };
        match self.store.record_refund(&record).await? {
            RefundOutcome::Recorded { payment, refund, session } => {
                tracing::info!(
                    session_id = %session.id,
                    amount = %refund.amount,
                    payment_status = %payment.status,
                    "Refund recorded"
                );
                self.effects
                    .notify(
                        NotificationType::RefundProcessed,
                        &session,
                        Some(format!("{} {}", refund.amount, refund.currency)),
                    )
                    .await;
                Ok(RefundReceipt {
                    session_id: session.id,
                    refund_id: refund.id,
                    gateway_refund_id: refund.gateway_refund_id,
                    amount: refund.amount,
                    currency: refund.currency,
                    payment_status: payment.status,
                    session_status: session.status,
                })
            }
            RefundOutcome::Conflict(current) => {
                tracing::error!(
                    target: "operator",
                    session_id = %session_id,
                    payment_status = %current.status,
                    "Gateway refund issued but the payment changed concurrently; ledger needs manual repair"
                );
                Err(AppError::Conflict("payment changed while the refund was in flight".to_string()).into())
            }
        }
    }

    async fn apply(&self, request: SettlementRequest) -> Result<SettlementOutcome, BookingError> {
        match self.store.settle_transaction(&request).await? {
            SettlementResult::Applied { transaction, session } => {
                tracing::info!(
                    order_id = %request.gateway_order_id,
                    source = %request.source,
                    payment_status = %transaction.status,
                    session_status = %session.status,
                    "Payment settled"
                );
                match transaction.status {
                    PaymentStatus::Success if session.status == SessionStatus::Confirmed => {
                        self.effects.on_confirmed(&session, request.now).await;
                    }
                    PaymentStatus::Failed => {
                        self.effects
                            .notify(NotificationType::PaymentFailed, &session, transaction.failure_reason.clone())
                            .await;
                    }
                    _ => {}
                }
                Ok(SettlementOutcome::Settled {
                    session_id: session.id,
                    session_status: session.status,
                    payment_status: transaction.status,
                })
            }
            SettlementResult::AlreadySettled { transaction, session } => {
                if request.status == PaymentStatus::Success && transaction.status == PaymentStatus::Failed {
                    tracing::error!(
                        target: "operator",
                        order_id = %request.gateway_order_id,
                        session_id = %session.id,
                        payment_id = ?request.gateway_payment_id,
                        source = %request.source,
                        "Captured payment reported for an order that already failed; refund manually"
                    );
                } else {
                    tracing::debug!(
                        order_id = %request.gateway_order_id,
                        source = %request.source,
                        "Order already settled"
                    );
                }
                Ok(SettlementOutcome::AlreadySettled {
                    session_id: session.id,
                    session_status: session.status,
                    payment_status: transaction.status,
                })
            }
            SettlementResult::UnknownOrder => {
                tracing::warn!(order_id = %request.gateway_order_id, source = %request.source, "Settlement for unknown order");
                Ok(SettlementOutcome::UnknownOrder {
                    order_id: request.gateway_order_id,
                })
            }
        }
    }

    async fn release(
        &self,
        session_id: Uuid,
        reason: &str,
        source: SettlementSource,
        now: DateTime<Utc>,
    ) -> Result<ExpiryOutcome, BookingError> {
        let request = ReleaseRequest {
            session_id,
            status: SessionStatus::Abandoned,
            reason: reason.to_string(),
            source,
            expired_by: Some(now),
            now,
        };
        match self.store.release_pending_session(&request).await? {
            ReleaseOutcome::Released(session) => {
                tracing::info!(session_id = %session.id, reason, "Reservation released");
                Ok(ExpiryOutcome::Resolved(session.status))
            }
            ReleaseOutcome::NotReleasable(_) | ReleaseOutcome::NotFound => Ok(ExpiryOutcome::Skipped),
        }
    }

    async fn session(&self, session_id: Uuid) -> Result<Session, BookingError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)).into())
    }
}

fn reconciled(
    order_id: &str,
    status: PaymentStatus,
    gateway_payment_id: Option<String>,
    failure_reason: Option<String>,
    failed_session_status: SessionStatus,
    now: DateTime<Utc>,
) -> SettlementRequest {
    SettlementRequest {
        gateway_order_id: order_id.to_string(),
        status,
        gateway_payment_id,
        failure_reason,
        source: SettlementSource::Reconciliation,
        failed_session_status,
        now,
    }
}

fn attempt_reason(gateway_reason: Option<String>, transaction: &PaymentTransaction) -> String {
    gateway_reason
        .or_else(|| transaction.failure_reason.clone())
        .unwrap_or_else(|| "payment attempt failed".to_string())
}
