use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use consultbook_auth::AuthenticatedUser;
use consultbook_common::{ApiResponse, AppError, SessionStatus, SessionType};
use consultbook_database::Session;

use crate::{
    availability::{hhmm, AvailabilityResponse},
    error::BookingError,
    orders::OrderHandle,
    reservation::ReservationRequest,
    sessions::SessionView,
    settlement::{RefundReceipt, SettlementOutcome},
    AppState,
};

pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";

type ApiResult<T> = Result<Json<ApiResponse<T>>, BookingError>;

fn validate<T: Validate>(request: &T) -> Result<(), BookingError> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()).into())
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    #[serde(default = "default_session_type")]
    pub session_type: SessionType,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

fn default_session_type() -> SessionType {
    SessionType::Personal
}

#[derive(Debug, Deserialize, Validate)]
pub struct ClientInfo {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 5, max = 32))]
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BookingRequest {
    pub consultant_id: Uuid,
    pub session_type: SessionType,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[validate]
    pub client: ClientInfo,
    pub amount: Decimal,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BookingResponse {
    pub session: Session,
    pub order: OrderHandle,
}

/// Checkout callback. Accepts both plain and gateway-prefixed field names.
#[derive(Debug, Deserialize, Validate)]
pub struct VerifyPaymentRequest {
    #[serde(alias = "razorpay_order_id")]
    #[validate(length(min = 1, max = 64))]
    pub order_id: String,
    #[serde(alias = "razorpay_payment_id")]
    #[validate(length(min = 1, max = 64))]
    pub payment_id: String,
    #[serde(alias = "razorpay_signature")]
    #[validate(length(min = 1, max = 128))]
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkSessionRequest {
    pub status: SessionStatus,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct RefundRequest {
    pub amount: Option<Decimal>,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

pub async fn health_check() -> Json<ApiResponse<serde_json::Value>> {
    Json(ApiResponse::success(json!({
        "status": "healthy",
        "service": "booking",
        "timestamp": Utc::now(),
    })))
}

pub async fn get_availability(
    State(state): State<AppState>,
    Path(consultant_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
) -> ApiResult<AvailabilityResponse> {
    let availability = state
        .availability
        .available_slots(consultant_id, query.session_type, query.from, query.to, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(availability)))
}

/// Reserves the slot and opens the payment order. When the reservation
/// succeeds but the order does not, the error still carries the session so
/// the client can retry the order alone.
pub async fn create_booking(
    State(state): State<AppState>,
    Json(request): Json<BookingRequest>,
) -> Result<(StatusCode, Json<ApiResponse<BookingResponse>>), Response> {
    validate(&request).map_err(IntoResponse::into_response)?;
    let now = Utc::now();

    let client = state
        .reservations
        .register_client(
            request.consultant_id,
            &request.client.name,
            &request.client.email,
            request.client.phone.as_deref(),
            now,
        )
        .await
        .map_err(IntoResponse::into_response)?;

    let currency = request
        .currency
        .unwrap_or_else(|| state.config.booking.default_currency.clone())
        .to_uppercase();
    let session = state
        .reservations
        .reserve(
            &ReservationRequest {
                consultant_id: request.consultant_id,
                session_type: request.session_type,
                date: request.date,
                start_time: request.start_time,
                client_id: client.id,
                amount: request.amount,
                currency,
            },
            now,
        )
        .await
        .map_err(IntoResponse::into_response)?;

    match state.orders.create_order(session.id, now).await {
        Ok(order) => Ok((
            StatusCode::CREATED,
            Json(ApiResponse::success(BookingResponse { session, order })),
        )),
        Err(err) => {
            tracing::warn!(session_id = %session.id, error = %err, "Order creation failed after reservation");
            let body = ApiResponse::error_with_data(
                err.error_code(),
                err.public_message(),
                json!({
                    "session_id": session.id,
                    "reservation_expires_at": session.reservation_expires_at,
                    "retry": format!("/sessions/{}/order", session.id),
                }),
            );
            Err((err.status_code(), Json(body)).into_response())
        }
    }
}

pub async fn create_order(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<OrderHandle> {
    let order = state.orders.create_order(session_id, Utc::now()).await?;
    Ok(Json(ApiResponse::success(order)))
}

pub async fn verify_payment(
    State(state): State<AppState>,
    Json(request): Json<VerifyPaymentRequest>,
) -> ApiResult<SettlementOutcome> {
    validate(&request)?;
    let outcome = state
        .settlement
        .verify_payment(&request.order_id, &request.payment_id, &request.signature, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// The raw body is kept as bytes: the signature covers it exactly.
pub async fn razorpay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<SettlementOutcome> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let outcome = state
        .settlement
        .handle_webhook(&body, signature, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn reconcile_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(order_id): Path<String>,
) -> ApiResult<SettlementOutcome> {
    let outcome = state.sessions.reconcile_order(&user, &order_id, Utc::now()).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn get_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SessionView> {
    let view = state.sessions.get_session(&user, session_id).await?;
    Ok(Json(ApiResponse::success(view)))
}

pub async fn cancel_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Session> {
    let session = state.sessions.cancel_session(&user, session_id, Utc::now()).await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn mark_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
    Json(request): Json<MarkSessionRequest>,
) -> ApiResult<Session> {
    let session = state
        .sessions
        .mark_session(&user, session_id, request.status, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn refund_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> ApiResult<RefundReceipt> {
    validate(&request)?;
    let receipt = state
        .sessions
        .refund_session(&user, session_id, request.amount, request.reason, Utc::now())
        .await?;
    Ok(Json(ApiResponse::success(receipt)))
}

pub async fn handler_404() -> (StatusCode, Json<ApiResponse<()>>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error("NOT_FOUND", "Endpoint not found".to_string())),
    )
}
