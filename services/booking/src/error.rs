use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use consultbook_common::{ApiResponse, AppError, RemoteCallError, SessionStatus};

use crate::gateways::{GatewayError, OP_FETCH_ORDER_STATUS};

pub const PAYMENT_BEING_CONFIRMED: &str = "Your payment is being confirmed, you will be notified";

/// Failures of the booking flow. Everything the client can act on has its
/// own variant and code; storage and plumbing failures travel as `App`.
#[derive(Error, Debug)]
pub enum BookingError {
    #[error("This time is no longer available, please choose another")]
    SlotUnavailable,

    #[error("The reservation has expired, please start the booking again")]
    ReservationExpired,

    #[error("Payment gateway did not answer {operation} in time")]
    GatewayTimeout { operation: &'static str },

    #[error("Payment gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Payment signature verification failed")]
    InvalidSignature,

    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error("Session cannot move from {from} to {to}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },

    #[error(transparent)]
    App(#[from] AppError),
}

impl From<sqlx::Error> for BookingError {
    fn from(err: sqlx::Error) -> Self {
        BookingError::App(AppError::Database(err))
    }
}

impl From<RemoteCallError<GatewayError>> for BookingError {
    fn from(err: RemoteCallError<GatewayError>) -> Self {
        match err {
            RemoteCallError::Timeout { operation, .. } => BookingError::GatewayTimeout { operation },
            RemoteCallError::Failed(e) => BookingError::GatewayRejected(e.to_string()),
        }
    }
}

impl BookingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BookingError::SlotUnavailable => StatusCode::CONFLICT,
            BookingError::ReservationExpired => StatusCode::GONE,
            BookingError::GatewayTimeout { operation } if *operation == OP_FETCH_ORDER_STATUS => {
                StatusCode::ACCEPTED
            }
            BookingError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BookingError::GatewayRejected(_) => StatusCode::BAD_GATEWAY,
            BookingError::InvalidSignature => StatusCode::UNAUTHORIZED,
            BookingError::RefundFailed(_) => StatusCode::BAD_GATEWAY,
            BookingError::InvalidTransition { .. } => StatusCode::CONFLICT,
            BookingError::App(e) => e.status_code(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            BookingError::SlotUnavailable => "SLOT_UNAVAILABLE",
            BookingError::ReservationExpired => "RESERVATION_EXPIRED",
            BookingError::GatewayTimeout { .. } => "GATEWAY_TIMEOUT",
            BookingError::GatewayRejected(_) => "GATEWAY_REJECTED",
            BookingError::InvalidSignature => "INVALID_SIGNATURE",
            BookingError::RefundFailed(_) => "REFUND_FAILED",
            BookingError::InvalidTransition { .. } => "INVALID_TRANSITION",
            BookingError::App(e) => e.error_code(),
        }
    }

    pub fn public_message(&self) -> String {
        match self {
            BookingError::GatewayTimeout { operation } if *operation == OP_FETCH_ORDER_STATUS => {
                PAYMENT_BEING_CONFIRMED.to_string()
            }
            BookingError::App(e) => e.public_message(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ApiResponse::<()>::error(self.error_code(), self.public_message());
        (status, Json(body)).into_response()
    }
}
