mod common;

use std::time::Duration as StdDuration;

use futures::future::join_all;
use rust_decimal::Decimal;

use consultbook_booking::{
    collaborators::NotificationType,
    error::BookingError,
    gateways::{GatewayOrderStatus, OP_CREATE_ORDER, OP_FETCH_ORDER_STATUS},
    jobs::run_maintenance_once,
    reservation::ReservationRequest,
    settlement::SettlementOutcome,
};
use consultbook_common::{PaymentStatus, SessionStatus, SessionType, TransactionKind};
use consultbook_database::{BookingStore, SlotKey};

use common::*;

async fn confirm(app: &TestApp, order_id: &str, payment_id: &str) -> SettlementOutcome {
    app.state
        .settlement
        .verify_payment(order_id, payment_id, &checkout_signature(order_id, payment_id), now())
        .await
        .unwrap()
}

async fn slot_is_booked(app: &TestApp) -> bool {
    let slots = app
        .store
        .list_slots(app.consultant.id, SessionType::Personal, monday(), monday())
        .await
        .unwrap();
    slots.iter().any(|s| s.start_time == ten() && s.is_booked)
}

#[tokio::test]
async fn monday_pattern_yields_one_slot() {
    let app = setup().await;
    let availability = app
        .state
        .availability
        .available_slots(app.consultant.id, SessionType::Personal, monday(), monday(), now())
        .await
        .unwrap();

    assert_eq!(availability.slots.len(), 1);
    let slot = &availability.slots[0];
    assert_eq!(slot.date, monday());
    assert_eq!(slot.start_time, ten());
    assert_eq!(slot.end_time.to_string(), "11:00:00");
    let json = serde_json::to_value(slot).unwrap();
    assert_eq!(json["start_time"], "10:00");
    assert_eq!(json["end_time"], "11:00");
}

#[tokio::test]
async fn two_simultaneous_reservations_have_one_winner() {
    let app = setup().await;
    let first = app.client("first@example.com").await;
    let second = app.client("second@example.com").await;
    let (a, b) = (app.reservation(&first), app.reservation(&second));

    let (ra, rb) = tokio::join!(
        app.state.reservations.reserve(&a, now()),
        app.state.reservations.reserve(&b, now()),
    );

    let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = if ra.is_ok() { rb } else { ra };
    assert!(matches!(loser, Err(BookingError::SlotUnavailable)));
    assert!(slot_is_booked(&app).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_reservations_have_exactly_one_winner() {
    let app = setup().await;
    let mut requests = Vec::new();
    for i in 0..16 {
        let client = app.client(&format!("client{}@example.com", i)).await;
        requests.push(app.reservation(&client));
    }

    let attempts = requests.into_iter().map(|request| {
        let reservations = app.state.reservations.clone();
        tokio::spawn(async move { reservations.reserve(&request, now()).await })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();

    let won = results.iter().filter(|r| r.is_ok()).count();
    let lost = results
        .iter()
        .filter(|r| matches!(r, Err(BookingError::SlotUnavailable)))
        .count();
    assert_eq!(won, 1);
    assert_eq!(lost, 15);
}

#[tokio::test]
async fn reserved_slot_disappears_from_availability() {
    let app = setup().await;
    app.reserve("ravi@example.com").await;
    let availability = app
        .state
        .availability
        .available_slots(app.consultant.id, SessionType::Personal, monday(), monday(), now())
        .await
        .unwrap();
    assert!(availability.slots.is_empty());
}

#[tokio::test]
async fn slot_not_offered_by_patterns_is_unavailable() {
    let app = setup().await;
    let client = app.client("ravi@example.com").await;
    let mut request = app.reservation(&client);
    request.start_time = chrono::NaiveTime::from_hms_opt(15, 0, 0).unwrap();
    let err = app.state.reservations.reserve(&request, now()).await.unwrap_err();
    assert!(matches!(err, BookingError::SlotUnavailable));
}

#[tokio::test]
async fn tampered_signature_changes_nothing() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;

    let mut signature = checkout_signature(&order.order_id, "pay_1");
    signature.replace_range(0..2, if signature.starts_with("00") { "11" } else { "00" });
    let err = app
        .state
        .settlement
        .verify_payment(&order.order_id, "pay_1", &signature, now())
        .await
        .unwrap_err();

    assert!(matches!(err, BookingError::InvalidSignature));
    let tx = app.store.find_transaction_by_order(&order.order_id).await.unwrap().unwrap();
    assert_eq!(tx.status, PaymentStatus::Pending);
    assert_eq!(app.session(session.id).await.status, SessionStatus::Pending);
    assert_eq!(app.notifier.total(), 0);
    assert_eq!(app.meetings.calls(), 0);
}

#[tokio::test]
async fn webhook_after_verify_is_already_settled() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;

    let first = confirm(&app, &order.order_id, "pay_1").await;
    assert!(matches!(
        first,
        SettlementOutcome::Settled {
            session_status: SessionStatus::Confirmed,
            payment_status: PaymentStatus::Success,
            ..
        }
    ));

    let body = webhook_body("payment.captured", &order.order_id, "pay_1");
    let second = app
        .state
        .settlement
        .handle_webhook(&body, Some(webhook_signature(&body).as_str()), now())
        .await
        .unwrap();
    assert!(matches!(second, SettlementOutcome::AlreadySettled { .. }));

    let confirmed = app.session(session.id).await;
    assert_eq!(confirmed.status, SessionStatus::Confirmed);
    assert!(confirmed.meeting_link.is_some());
    assert_eq!(app.meetings.calls(), 1);
    assert_eq!(app.notifier.count(NotificationType::BookingConfirmed), 1);
}

#[tokio::test]
async fn webhook_then_verify_gives_the_same_result() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;

    let body = webhook_body("payment.captured", &order.order_id, "pay_1");
    let signature = webhook_signature(&body);
    let first = app.state.settlement.handle_webhook(&body, Some(signature.as_str()), now()).await.unwrap();
    assert!(matches!(first, SettlementOutcome::Settled { .. }));

    // A redelivered webhook and the late browser callback are both no-ops.
    let again = app.state.settlement.handle_webhook(&body, Some(signature.as_str()), now()).await.unwrap();
    assert!(matches!(again, SettlementOutcome::AlreadySettled { .. }));
    let verify = confirm(&app, &order.order_id, "pay_1").await;
    assert!(matches!(
        verify,
        SettlementOutcome::AlreadySettled {
            session_status: SessionStatus::Confirmed,
            ..
        }
    ));

    assert_eq!(app.session(session.id).await.status, SessionStatus::Confirmed);
    assert_eq!(app.meetings.calls(), 1);
    assert_eq!(app.notifier.count(NotificationType::BookingConfirmed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_signals_settle_exactly_once() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    let body = webhook_body("payment.captured", &order.order_id, "pay_1");
    let signature = webhook_signature(&body);

    let settlement = app.state.settlement.clone();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let settlement = settlement.clone();
        let order_id = order.order_id.clone();
        let body = body.clone();
        let signature = signature.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                settlement
                    .verify_payment(&order_id, "pay_1", &checkout_signature(&order_id, "pay_1"), now())
                    .await
            } else {
                settlement.handle_webhook(&body, Some(signature.as_str()), now()).await
            }
        }));
    }
    let outcomes: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap().unwrap()).collect();

    let settled = outcomes
        .iter()
        .filter(|o| matches!(o, SettlementOutcome::Settled { .. }))
        .count();
    assert_eq!(settled, 1);
    assert_eq!(app.session(session.id).await.status, SessionStatus::Confirmed);
    assert_eq!(app.notifier.count(NotificationType::BookingConfirmed), 1);
    assert_eq!(app.meetings.calls(), 1);
}

#[tokio::test]
async fn unsigned_webhook_is_rejected() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    let body = webhook_body("payment.captured", &order.order_id, "pay_1");

    let missing = app.state.settlement.handle_webhook(&body, None, now()).await;
    assert!(matches!(missing, Err(BookingError::InvalidSignature)));
    let wrong = app
        .state
        .settlement
        .handle_webhook(&body, Some(checkout_signature(&order.order_id, "pay_1").as_str()), now())
        .await;
    assert!(matches!(wrong, Err(BookingError::InvalidSignature)));
    assert_eq!(app.session(session.id).await.status, SessionStatus::Pending);
}

#[tokio::test]
async fn unrelated_webhook_events_are_ignored() {
    let app = setup().await;
    let body = br#"{"event":"refund.created","payload":{}}"#.to_vec();
    let outcome = app
        .state
        .settlement
        .handle_webhook(&body, Some(webhook_signature(&body).as_str()), now())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SettlementOutcome::Ignored {
            event: "refund.created".to_string()
        }
    );
}

async fn failed_webhook(app: &TestApp, order_id: &str, payment_id: &str) -> SettlementOutcome {
    let body = webhook_body("payment.failed", order_id, payment_id);
    app.state
        .settlement
        .handle_webhook(&body, Some(webhook_signature(&body).as_str()), now())
        .await
        .unwrap()
}

#[tokio::test]
async fn failed_payment_webhook_keeps_the_hold_until_expiry() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;

    let outcome = failed_webhook(&app, &order.order_id, "pay_1").await;
    assert_eq!(
        outcome,
        SettlementOutcome::Pending {
            order_id: order.order_id.clone()
        }
    );
    let tx = app.store.find_transaction_by_order(&order.order_id).await.unwrap().unwrap();
    assert_eq!(tx.status, PaymentStatus::Pending);
    assert_eq!(tx.failure_reason.as_deref(), Some("card declined"));
    assert_eq!(app.session(session.id).await.status, SessionStatus::Pending);
    assert!(slot_is_booked(&app).await);
    assert_eq!(app.notifier.total(), 0);

    // Once the hold lapses with no capture, the sweep cancels it.
    app.gateway
        .set_status(&order.order_id, GatewayOrderStatus::Attempted { reason: None });
    let report = app.state.reservations.sweep_expired(now() + minutes(11)).await.unwrap();
    assert_eq!(report.cancelled, 1);

    let tx = app.store.find_transaction_by_order(&order.order_id).await.unwrap().unwrap();
    assert_eq!(tx.status, PaymentStatus::Failed);
    assert_eq!(tx.failure_reason.as_deref(), Some("card declined"));
    assert_eq!(app.session(session.id).await.status, SessionStatus::Cancelled);
    assert!(!slot_is_booked(&app).await);
    assert_eq!(app.notifier.count(NotificationType::PaymentFailed), 1);

    app.state
        .reservations
        .reserve(&app.reservation(&app.client("next@example.com").await), now() + minutes(12))
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_attempt_and_retry_confirm_in_either_order() {
    let failed_first = setup().await;
    let (first_session, first_order) = failed_first.reserve_with_order("ravi@example.com").await;
    failed_webhook(&failed_first, &first_order.order_id, "pay_1").await;
    let outcome = confirm(&failed_first, &first_order.order_id, "pay_2").await;
    assert!(matches!(
        outcome,
        SettlementOutcome::Settled {
            session_status: SessionStatus::Confirmed,
            ..
        }
    ));

    let paid_first = setup().await;
    let (second_session, second_order) = paid_first.reserve_with_order("ravi@example.com").await;
    confirm(&paid_first, &second_order.order_id, "pay_2").await;
    let outcome = failed_webhook(&paid_first, &second_order.order_id, "pay_1").await;
    assert!(matches!(
        outcome,
        SettlementOutcome::AlreadySettled {
            session_status: SessionStatus::Confirmed,
            payment_status: PaymentStatus::Success,
            ..
        }
    ));

    for (app, session_id, order_id) in [
        (&failed_first, first_session.id, &first_order.order_id),
        (&paid_first, second_session.id, &second_order.order_id),
    ] {
        assert_eq!(app.session(session_id).await.status, SessionStatus::Confirmed);
        let tx = app.store.find_transaction_by_order(order_id).await.unwrap().unwrap();
        assert_eq!(tx.status, PaymentStatus::Success);
        assert_eq!(tx.gateway_payment_id.as_deref(), Some("pay_2"));
        assert!(slot_is_booked(app).await);
        assert_eq!(app.notifier.count(NotificationType::BookingConfirmed), 1);
        assert_eq!(app.notifier.count(NotificationType::PaymentFailed), 0);

        let intruder = app.client("other@example.com").await;
        let err = app
            .state
            .reservations
            .reserve(&app.reservation(&intruder), now())
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::SlotUnavailable));
    }
}

#[tokio::test]
async fn expired_reservation_is_abandoned_and_slot_reopens() {
    let app = setup().await;
    let session = app.reserve("ravi@example.com").await;
    let later = now() + minutes(11);

    let report = app.state.reservations.sweep_expired(later).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.abandoned, 1);
    assert_eq!(app.session(session.id).await.status, SessionStatus::Abandoned);
    assert!(!slot_is_booked(&app).await);

    let availability = app
        .state
        .availability
        .available_slots(app.consultant.id, SessionType::Personal, monday(), monday(), later)
        .await
        .unwrap();
    assert_eq!(availability.slots.len(), 1);
}

#[tokio::test]
async fn reserve_sweeps_an_expired_hold_on_the_slot() {
    let app = setup().await;
    let stale = app.reserve("ravi@example.com").await;

    let client = app.client("next@example.com").await;
    let fresh = app
        .state
        .reservations
        .reserve(&app.reservation(&client), now() + minutes(11))
        .await
        .unwrap();

    assert_ne!(fresh.id, stale.id);
    assert_eq!(app.session(stale.id).await.status, SessionStatus::Abandoned);
    assert_eq!(fresh.status, SessionStatus::Pending);
}

#[tokio::test]
async fn live_hold_is_not_swept_by_reserve() {
    let app = setup().await;
    let holder = app.reserve("ravi@example.com").await;
    let client = app.client("next@example.com").await;

    let err = app
        .state
        .reservations
        .reserve(&app.reservation(&client), now() + minutes(5))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::SlotUnavailable));
    assert_eq!(app.session(holder.id).await.status, SessionStatus::Pending);
}

#[tokio::test]
async fn expiry_confirms_an_order_paid_at_the_gateway() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    app.gateway.set_status(
        &order.order_id,
        GatewayOrderStatus::Paid {
            payment_id: "pay_late".to_string(),
        },
    );

    let report = app.state.reservations.sweep_expired(now() + minutes(11)).await.unwrap();
    assert_eq!(report.confirmed, 1);

    assert_eq!(app.session(session.id).await.status, SessionStatus::Confirmed);
    let tx = app.store.find_transaction_by_order(&order.order_id).await.unwrap().unwrap();
    assert_eq!(tx.gateway_payment_id.as_deref(), Some("pay_late"));
    assert_eq!(app.notifier.count(NotificationType::BookingConfirmed), 1);
}

#[tokio::test]
async fn expiry_with_failed_attempts_cancels() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    app.gateway.set_status(
        &order.order_id,
        GatewayOrderStatus::Attempted {
            reason: Some("bank declined".to_string()),
        },
    );

    let report = app.state.reservations.sweep_expired(now() + minutes(11)).await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(app.session(session.id).await.status, SessionStatus::Cancelled);
    assert!(!slot_is_booked(&app).await);
}

#[tokio::test]
async fn expiry_without_any_attempt_abandons() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;

    let report = app.state.reservations.sweep_expired(now() + minutes(11)).await.unwrap();
    assert_eq!(report.abandoned, 1);
    assert_eq!(app.session(session.id).await.status, SessionStatus::Abandoned);
    let tx = app.store.find_transaction_by_order(&order.order_id).await.unwrap().unwrap();
    assert_eq!(tx.status, PaymentStatus::Failed);
}

#[tokio::test]
async fn gateway_timeout_defers_until_the_grace_window_ends() {
    let app = setup().await;
    let (session, _order) = app.reserve_with_order("ravi@example.com").await;
    app.gateway
        .set_status_delay(Some(StdDuration::from_millis(DEADLINE_MS * 3)));

    let report = app.state.reservations.sweep_expired(now() + minutes(11)).await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(app.session(session.id).await.status, SessionStatus::Pending);
    assert!(slot_is_booked(&app).await);

    // Reservation TTL 10 minutes plus 15 minutes of grace.
    let report = app.state.reservations.sweep_expired(now() + minutes(26)).await.unwrap();
    assert_eq!(report.abandoned, 1);
    assert_eq!(app.session(session.id).await.status, SessionStatus::Abandoned);
    assert!(!slot_is_booked(&app).await);
}

#[tokio::test]
async fn deferred_hold_yields_to_fresher_expiries() {
    let app = setup().await;
    let (stuck, _order) = app.reserve_with_order("ravi@example.com").await;
    app.gateway
        .set_status_delay(Some(StdDuration::from_millis(DEADLINE_MS * 3)));

    let report = app.state.reservations.sweep_expired(now() + minutes(11)).await.unwrap();
    assert_eq!(report.deferred, 1);

    let client = app.client("next@example.com").await;
    let request = ReservationRequest {
        date: monday() + chrono::Duration::days(7),
        ..app.reservation(&client)
    };
    let fresh = app.state.reservations.reserve(&request, now() + minutes(1)).await.unwrap();

    let first = app
        .store
        .list_expired_pending_sessions(now() + minutes(12), 1)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, fresh.id);
    assert_eq!(app.session(stuck.id).await.status, SessionStatus::Pending);
}

#[tokio::test]
async fn on_demand_reconcile_reports_timeout_as_being_confirmed() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    app.gateway
        .set_status_delay(Some(StdDuration::from_millis(DEADLINE_MS * 3)));

    let err = app
        .state
        .sessions
        .reconcile_order(&app.owner, &order.order_id, now())
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::GatewayTimeout { operation } if operation == OP_FETCH_ORDER_STATUS));
    assert_eq!(err.status_code(), axum::http::StatusCode::ACCEPTED);
    assert_eq!(app.session(session.id).await.status, SessionStatus::Pending);
}

#[tokio::test]
async fn on_demand_reconcile_settles_a_paid_order() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    app.gateway.set_status(
        &order.order_id,
        GatewayOrderStatus::Paid {
            payment_id: "pay_9".to_string(),
        },
    );

    let outcome = app
        .state
        .sessions
        .reconcile_order(&app.owner, &order.order_id, now())
        .await
        .unwrap();
    assert!(matches!(outcome, SettlementOutcome::Settled { .. }));
    assert_eq!(app.session(session.id).await.status, SessionStatus::Confirmed);
}

#[tokio::test]
async fn order_creation_is_idempotent_per_session() {
    let app = setup().await;
    let (session, first) = app.reserve_with_order("ravi@example.com").await;
    let second = app.state.orders.create_order(session.id, now()).await.unwrap();

    assert_eq!(first.order_id, second.order_id);
    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(first.amount_minor, 150000);
    assert_eq!(app.gateway.orders_created(), 1);
}

#[tokio::test]
async fn order_timeout_keeps_the_reservation_for_a_retry() {
    let app = setup().await;
    let session = app.reserve("ravi@example.com").await;
    app.gateway
        .set_create_delay(Some(StdDuration::from_millis(DEADLINE_MS * 3)));

    let err = app.state.orders.create_order(session.id, now()).await.unwrap_err();
    assert!(matches!(err, BookingError::GatewayTimeout { operation } if operation == OP_CREATE_ORDER));
    assert_eq!(err.status_code(), axum::http::StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(app.session(session.id).await.status, SessionStatus::Pending);

    app.gateway.set_create_delay(None);
    let order = app.state.orders.create_order(session.id, now()).await.unwrap();
    assert!(!order.reused);
}

#[tokio::test]
async fn order_after_expiry_requires_a_new_booking() {
    let app = setup().await;
    let session = app.reserve("ravi@example.com").await;
    let err = app
        .state
        .orders
        .create_order(session.id, now() + minutes(10))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::ReservationExpired));
}

#[tokio::test]
async fn cancel_before_payment_then_late_success_is_escalated_not_applied() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    let ravi = app.user_for("ravi@example.com");

    let cancelled = app.state.sessions.cancel_session(&ravi, session.id, now()).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert!(!slot_is_booked(&app).await);

    let late = confirm(&app, &order.order_id, "pay_1").await;
    assert!(matches!(
        late,
        SettlementOutcome::AlreadySettled {
            session_status: SessionStatus::Cancelled,
            payment_status: PaymentStatus::Failed,
            ..
        }
    ));
    assert_eq!(app.notifier.count(NotificationType::BookingConfirmed), 0);
}

#[tokio::test]
async fn confirmed_session_cannot_be_cancelled() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    confirm(&app, &order.order_id, "pay_1").await;

    let err = app
        .state
        .sessions
        .cancel_session(&app.user_for("ravi@example.com"), session.id, now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::InvalidTransition {
            from: SessionStatus::Confirmed,
            to: SessionStatus::Cancelled
        }
    ));
    assert!(slot_is_booked(&app).await);
}

#[tokio::test]
async fn strangers_cannot_cancel() {
    let app = setup().await;
    let session = app.reserve("ravi@example.com").await;
    let err = app
        .state
        .sessions
        .cancel_session(&app.user_for("mallory@example.com"), session.id, now())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "AUTHORIZATION_ERROR");
}

#[tokio::test]
async fn full_refund_returns_the_session() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    confirm(&app, &order.order_id, "pay_1").await;

    let receipt = app
        .state
        .sessions
        .refund_session(&app.owner, session.id, None, Some("consultant unavailable".to_string()), now())
        .await
        .unwrap();

    assert_eq!(receipt.amount, Decimal::new(150000, 2));
    assert_eq!(receipt.payment_status, PaymentStatus::Refunded);
    assert_eq!(receipt.session_status, SessionStatus::Returned);
    assert_eq!(app.gateway.refunds(), vec![("pay_1".to_string(), 150000)]);
    assert_eq!(app.notifier.count(NotificationType::RefundProcessed), 1);

    let transactions = app.store.transactions_for_session(session.id).await.unwrap();
    let refund = transactions.iter().find(|t| t.kind == TransactionKind::Refund).unwrap();
    assert_eq!(refund.gateway_refund_id.as_deref(), Some("rfnd_1"));
}

#[tokio::test]
async fn partial_refunds_until_the_balance_is_exhausted() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    confirm(&app, &order.order_id, "pay_1").await;
    let refunds = &app.state.sessions;

    let first = refunds
        .refund_session(&app.owner, session.id, Some(Decimal::new(50000, 2)), None, now())
        .await
        .unwrap();
    assert_eq!(first.payment_status, PaymentStatus::PartiallyRefunded);
    assert_eq!(first.session_status, SessionStatus::Returned);

    let too_much = refunds
        .refund_session(&app.owner, session.id, Some(Decimal::new(200000, 2)), None, now())
        .await
        .unwrap_err();
    assert_eq!(too_much.error_code(), "VALIDATION_ERROR");

    let rest = refunds
        .refund_session(&app.owner, session.id, Some(Decimal::new(100000, 2)), None, now())
        .await
        .unwrap();
    assert_eq!(rest.payment_status, PaymentStatus::Refunded);

    let done = refunds.refund_session(&app.owner, session.id, None, None, now()).await;
    assert!(matches!(done, Err(BookingError::InvalidTransition { .. })));
    assert_eq!(app.gateway.refunds().len(), 2);
}

#[tokio::test]
async fn rejected_refund_leaves_the_session_confirmed() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    confirm(&app, &order.order_id, "pay_1").await;
    app.gateway.fail_refunds(true);

    let err = app
        .state
        .sessions
        .refund_session(&app.owner, session.id, None, None, now())
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::RefundFailed(_)));
    assert_eq!(app.session(session.id).await.status, SessionStatus::Confirmed);
    let tx = app.store.find_transaction_by_order(&order.order_id).await.unwrap().unwrap();
    assert_eq!(tx.status, PaymentStatus::Success);
}

#[tokio::test]
async fn pending_session_cannot_be_refunded() {
    let app = setup().await;
    let session = app.reserve("ravi@example.com").await;
    let err = app
        .state
        .sessions
        .refund_session(&app.owner, session.id, None, None, now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::InvalidTransition {
            from: SessionStatus::Pending,
            ..
        }
    ));
}

#[tokio::test]
async fn sessions_start_and_complete_with_time() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    confirm(&app, &order.order_id, "pay_1").await;

    let start = session.scheduled_start + minutes(1);
    let report = app.state.sessions.advance_sessions(start).await.unwrap();
    assert_eq!(report.started, 1);
    assert_eq!(app.session(session.id).await.status, SessionStatus::Ongoing);

    let before_grace = session.scheduled_end + minutes(5);
    let report = app.state.sessions.advance_sessions(before_grace).await.unwrap();
    assert_eq!(report.completed, 0);

    let after_grace = session.scheduled_end + minutes(16);
    let report = app.state.sessions.advance_sessions(after_grace).await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(app.session(session.id).await.status, SessionStatus::Completed);
}

#[tokio::test]
async fn meeting_link_failure_does_not_block_confirmation() {
    let app = setup().await;
    app.meetings.set_failing(true);
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    confirm(&app, &order.order_id, "pay_1").await;

    let confirmed = app.session(session.id).await;
    assert_eq!(confirmed.status, SessionStatus::Confirmed);
    assert!(confirmed.meeting_link.is_none());
    assert_eq!(app.notifier.count(NotificationType::BookingConfirmed), 1);

    app.meetings.set_failing(false);
    let report = app.state.sessions.advance_sessions(now()).await.unwrap();
    assert_eq!(report.meeting_links, 1);
    assert!(app.session(session.id).await.meeting_link.is_some());
}

#[tokio::test]
async fn consultant_marks_no_show_after_start() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    confirm(&app, &order.order_id, "pay_1").await;

    let early = app
        .state
        .sessions
        .mark_session(&app.owner, session.id, SessionStatus::NoShow, now())
        .await
        .unwrap_err();
    assert_eq!(early.error_code(), "VALIDATION_ERROR");

    let marked = app
        .state
        .sessions
        .mark_session(&app.owner, session.id, SessionStatus::NoShow, session.scheduled_start + minutes(20))
        .await
        .unwrap();
    assert_eq!(marked.status, SessionStatus::NoShow);
}

#[tokio::test]
async fn completing_a_started_confirmed_session_passes_through_ongoing() {
    let app = setup().await;
    let (session, order) = app.reserve_with_order("ravi@example.com").await;
    confirm(&app, &order.order_id, "pay_1").await;

    let marked = app
        .state
        .sessions
        .mark_session(&app.owner, session.id, SessionStatus::Completed, session.scheduled_end)
        .await
        .unwrap();
    assert_eq!(marked.status, SessionStatus::Completed);
}

#[tokio::test]
async fn confirmed_is_not_a_markable_status() {
    let app = setup().await;
    let session = app.reserve("ravi@example.com").await;
    let err = app
        .state
        .sessions
        .mark_session(&app.owner, session.id, SessionStatus::Confirmed, now())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
    assert_eq!(app.session(session.id).await.status, SessionStatus::Pending);
}

#[tokio::test]
async fn maintenance_pass_sweeps_and_progresses() {
    let app = setup().await;
    let session = app.reserve("ravi@example.com").await;

    let report = run_maintenance_once(&app.state.reservations, &app.state.sessions, now() + minutes(11))
        .await
        .unwrap();
    assert_eq!(report.sweep.abandoned, 1);
    assert_eq!(report.progress.started, 0);

    let key = SlotKey {
        consultant_id: app.consultant.id,
        session_type: SessionType::Personal,
        date: monday(),
        start_time: ten(),
    };
    assert!(app.store.session_holding_slot(&key).await.unwrap().is_none());
    assert_eq!(app.session(session.id).await.status, SessionStatus::Abandoned);
}
