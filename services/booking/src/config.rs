use std::time::Duration;

use consultbook_common::{
    env_opt, env_or, env_parse, env_secret, AppError, DatabaseConfig, JwtConfig, ServerConfig,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub store: StoreBackend,
    pub jwt: JwtConfig,
    pub booking: BookingRules,
    pub razorpay: RazorpayConfig,
    pub collaborators: CollaboratorConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Timing and money rules for the booking flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRules {
    pub reservation_ttl_minutes: i64,
    pub min_lead_minutes: i64,
    pub max_range_days: i64,
    pub reconciliation_grace_minutes: i64,
    pub completion_grace_minutes: i64,
    pub default_currency: String,
    pub max_transaction_amount: Decimal,
    pub sweep_cron: String,
    pub session_progress_cron: String,
    pub sweep_batch_size: i64,
}

impl BookingRules {
    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.reservation_ttl_minutes)
    }

    pub fn min_lead(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.min_lead_minutes)
    }

    pub fn reconciliation_grace(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.reconciliation_grace_minutes)
    }

    pub fn completion_grace(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.completion_grace_minutes)
    }
}

impl Default for BookingRules {
    fn default() -> Self {
        Self {
            reservation_ttl_minutes: 10,
            min_lead_minutes: 15,
            max_range_days: 60,
            reconciliation_grace_minutes: 15,
            completion_grace_minutes: 15,
            default_currency: "INR".to_string(),
            max_transaction_amount: Decimal::new(5_000_000, 2),
            sweep_cron: "0 * * * * *".to_string(),
            session_progress_cron: "30 * * * * *".to_string(),
            sweep_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: String,
    pub base_url: String,
    pub merchant_name: String,
    pub deadlines: GatewayDeadlines,
}

/// Per-operation deadlines for gateway calls, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GatewayDeadlines {
    pub create_order_ms: u64,
    pub status_ms: u64,
    pub refund_ms: u64,
}

impl GatewayDeadlines {
    pub fn create_order(&self) -> Duration {
        Duration::from_millis(self.create_order_ms)
    }

    pub fn status(&self) -> Duration {
        Duration::from_millis(self.status_ms)
    }

    pub fn refund(&self) -> Duration {
        Duration::from_millis(self.refund_ms)
    }
}

impl Default for GatewayDeadlines {
    fn default() -> Self {
        Self {
            create_order_ms: 8_000,
            status_ms: 5_000,
            refund_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    pub meetings_service_url: Option<String>,
    pub notifications_service_url: Option<String>,
    pub meeting_link_timeout_ms: u64,
}

impl CollaboratorConfig {
    pub fn meeting_link_timeout(&self) -> Duration {
        Duration::from_millis(self.meeting_link_timeout_ms)
    }
}

impl BookingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let store = match env_or("BOOKING_STORE", "postgres").to_lowercase().as_str() {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(AppError::Validation(format!(
                    "BOOKING_STORE must be postgres or memory, got {}",
                    other
                )))
            }
        };

        let defaults = BookingRules::default();
        let booking = BookingRules {
            reservation_ttl_minutes: env_parse("RESERVATION_TTL_MINUTES", defaults.reservation_ttl_minutes),
            min_lead_minutes: env_parse("MIN_LEAD_MINUTES", defaults.min_lead_minutes),
            max_range_days: env_parse("MAX_RANGE_DAYS", defaults.max_range_days),
            reconciliation_grace_minutes: env_parse(
                "RECONCILIATION_GRACE_MINUTES",
                defaults.reconciliation_grace_minutes,
            ),
            completion_grace_minutes: env_parse("COMPLETION_GRACE_MINUTES", defaults.completion_grace_minutes),
            default_currency: env_or("DEFAULT_CURRENCY", &defaults.default_currency).to_uppercase(),
            max_transaction_amount: env_parse("MAX_TRANSACTION_AMOUNT", defaults.max_transaction_amount),
            sweep_cron: env_or("SWEEP_CRON", &defaults.sweep_cron),
            session_progress_cron: env_or("SESSION_PROGRESS_CRON", &defaults.session_progress_cron),
            sweep_batch_size: env_parse("SWEEP_BATCH_SIZE", defaults.sweep_batch_size),
        };
        if booking.reservation_ttl_minutes <= 0 {
            return Err(AppError::Validation("RESERVATION_TTL_MINUTES must be positive".to_string()));
        }

        // Built-in secrets are for local runs only.
        let allow_dev_secrets = store == StoreBackend::Memory || env_parse("ALLOW_DEV_SECRETS", false);
        let deadlines = GatewayDeadlines::default();

        Ok(Self {
            server: ServerConfig {
                host: env_or("BOOKING_HOST", "0.0.0.0"),
                port: env_parse("BOOKING_PORT", 8010),
                cors_origins: env_or("CORS_ORIGINS", "http://localhost:3000")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            database: DatabaseConfig::from_env(),
            store,
            jwt: JwtConfig::from_env(allow_dev_secrets)?,
            booking,
            razorpay: RazorpayConfig {
                key_id: env_or("RAZORPAY_KEY_ID", "rzp_test_key"),
                key_secret: env_secret("RAZORPAY_KEY_SECRET", "rzp_test_secret", allow_dev_secrets)?,
                webhook_secret: env_secret("RAZORPAY_WEBHOOK_SECRET", "rzp_test_webhook_secret", allow_dev_secrets)?,
                base_url: env_or("RAZORPAY_BASE_URL", "https://api.razorpay.com"),
                merchant_name: env_or("RAZORPAY_MERCHANT_NAME", "Consultbook"),
                deadlines: GatewayDeadlines {
                    create_order_ms: env_parse("GATEWAY_CREATE_ORDER_TIMEOUT_MS", deadlines.create_order_ms),
                    status_ms: env_parse("GATEWAY_STATUS_TIMEOUT_MS", deadlines.status_ms),
                    refund_ms: env_parse("GATEWAY_REFUND_TIMEOUT_MS", deadlines.refund_ms),
                },
            },
            collaborators: CollaboratorConfig {
                meetings_service_url: env_opt("MEETINGS_SERVICE_URL"),
                notifications_service_url: env_opt("NOTIFICATIONS_SERVICE_URL"),
                meeting_link_timeout_ms: env_parse("MEETING_LINK_TIMEOUT_MS", 5_000),
            },
        })
    }
}
