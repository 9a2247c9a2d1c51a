use axum::{
    routing::{get, post},
    Router,
};

use crate::{handlers, AppState};

pub fn create_routes() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))

        // Public booking flow
        .route("/consultants/:consultant_id/availability", get(handlers::get_availability))
        .route("/bookings", post(handlers::create_booking))
        .route("/sessions/:session_id/order", post(handlers::create_order))

        // Payment signals (authenticated by HMAC, not JWT)
        .route("/payments/verify", post(handlers::verify_payment))
        .route("/webhooks/razorpay", post(handlers::razorpay_webhook))

        // Consultant, client and admin actions (JWT)
        .route("/payments/:order_id/reconcile", post(handlers::reconcile_order))
        .route("/sessions/:session_id", get(handlers::get_session))
        .route("/sessions/:session_id/cancel", post(handlers::cancel_session))
        .route("/sessions/:session_id/mark", post(handlers::mark_session))
        .route("/sessions/:session_id/refund", post(handlers::refund_session))
}
