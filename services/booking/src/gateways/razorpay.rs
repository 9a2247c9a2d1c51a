use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;

use crate::config::RazorpayConfig;

use super::{
    signature, CheckoutConfig, CreateOrderRequest, GatewayError, GatewayOrder, GatewayOrderStatus,
    GatewayRefund, PaymentGateway,
};

#[derive(Clone)]
pub struct RazorpayGateway {
    client: Client,
    config: RazorpayConfig,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
    amount: i64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayPayment {
    id: String,
    status: String,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RazorpayCollection<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RazorpayRefund {
    id: String,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct RazorpayErrorBody {
    error: RazorpayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct RazorpayErrorDetail {
    code: Option<String>,
    description: Option<String>,
}

impl RazorpayGateway {
    pub fn new(config: RazorpayConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn parse<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, GatewayError> {
        if response.status().is_success() {
            return response.json::<T>().await.map_err(GatewayError::from);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<RazorpayErrorBody>(&body) {
            Ok(parsed) => format!(
                "{}: {}",
                parsed.error.code.unwrap_or_else(|| status.to_string()),
                parsed.error.description.unwrap_or_default()
            ),
            Err(_) => format!("HTTP {}", status),
        };
        if status.is_server_error() {
            Err(GatewayError::Transport(message))
        } else {
            Err(GatewayError::Rejected(message))
        }
    }
}

/// Folds the payment attempts of one order into a single status.
fn order_status_from_payments(payments: &[RazorpayPayment]) -> GatewayOrderStatus {
    if let Some(paid) = payments
        .iter()
        .find(|p| p.status == "captured" || p.status == "refunded")
    {
        return GatewayOrderStatus::Paid {
            payment_id: paid.id.clone(),
        };
    }
    if payments.is_empty() {
        return GatewayOrderStatus::Created;
    }
    if payments.iter().all(|p| p.status == "failed") {
        return GatewayOrderStatus::Attempted {
            reason: payments.iter().rev().find_map(|p| p.error_description.clone()),
        };
    }
    GatewayOrderStatus::InProgress
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn checkout_config(&self) -> CheckoutConfig {
        CheckoutConfig {
            key_id: self.config.key_id.clone(),
            merchant_name: self.config.merchant_name.clone(),
        }
    }

    async fn create_order(&self, request: &CreateOrderRequest) -> Result<GatewayOrder, GatewayError> {
        let response = self
            .client
            .post(self.url("/v1/orders"))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&json!({
                "amount": request.amount_minor,
                "currency": request.currency,
                "receipt": request.receipt,
                "notes": request.notes,
                "payment_capture": 1,
            }))
            .send()
            .await?;

        let order: RazorpayOrder = Self::parse(response).await?;
        tracing::debug!(order_id = %order.id, amount = order.amount, "Razorpay order created");
        Ok(GatewayOrder {
            order_id: order.id,
            amount_minor: order.amount,
            currency: order.currency,
        })
    }

    async fn fetch_order_status(&self, order_id: &str) -> Result<GatewayOrderStatus, GatewayError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/orders/{}/payments", order_id)))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .send()
            .await?;

        let payments: RazorpayCollection<RazorpayPayment> = Self::parse(response).await?;
        Ok(order_status_from_payments(&payments.items))
    }

    async fn refund_payment(
        &self,
        payment_id: &str,
        amount_minor: i64,
        notes: HashMap<String, String>,
    ) -> Result<GatewayRefund, GatewayError> {
        let response = self
            .client
            .post(self.url(&format!("/v1/payments/{}/refund", payment_id)))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&json!({
                "amount": amount_minor,
                "notes": notes,
            }))
            .send()
            .await?;

        let refund: RazorpayRefund = Self::parse(response).await?;
        Ok(GatewayRefund {
            refund_id: refund.id,
            amount_minor: refund.amount,
        })
    }

    fn verify_payment_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        let payload = signature::checkout_payload(order_id, payment_id);
        signature::verify(&self.config.key_secret, payload.as_bytes(), signature)
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        signature::verify(&self.config.webhook_secret, payload, signature)
    }
}
