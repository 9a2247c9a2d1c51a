pub mod razorpay;
pub mod signature;

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use razorpay::RazorpayGateway;

// Operation names carried by timeouts; the HTTP layer keys on them.
pub const OP_CREATE_ORDER: &str = "create_order";
pub const OP_FETCH_ORDER_STATUS: &str = "fetch_order_status";
pub const OP_REFUND: &str = "refund_payment";

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

/// What the paying browser needs to open the checkout widget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutConfig {
    pub key_id: String,
    pub merchant_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub receipt: String,
    pub notes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub order_id: String,
    pub amount_minor: i64,
    pub currency: String,
}

/// Gateway-side view of an order, as used by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOrderStatus {
    /// No payment attempt yet.
    Created,
    /// A payment is authorized but not yet captured.
    InProgress,
    /// Every attempt failed.
    Attempted { reason: Option<String> },
    Paid { payment_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub refund_id: String,
    pub amount_minor: i64,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Public checkout parameters, known locally.
    fn checkout_config(&self) -> CheckoutConfig;

    async fn create_order(&self, request: &CreateOrderRequest) -> Result<GatewayOrder, GatewayError>;

    async fn fetch_order_status(&self, order_id: &str) -> Result<GatewayOrderStatus, GatewayError>;

    async fn refund_payment(
        &self,
        payment_id: &str,
        amount_minor: i64,
        notes: HashMap<String, String>,
    ) -> Result<GatewayRefund, GatewayError>;

    /// Checks the signature the browser returns after checkout.
    fn verify_payment_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool;

    /// Checks the signature header over the raw webhook body.
    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool;
}

/// Converts a major-unit amount with at most two decimals into minor units.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    if amount.scale() > 2 {
        return None;
    }
    (amount * Decimal::ONE_HUNDRED).trunc().to_i64()
}
