use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

/// Declares a unit-variant enum that is stored as upper-case text in the
/// database and serialized the same way on the wire.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(crate::AppError::Validation(format!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum! {
    pub enum UserRole {
        Client => "client",
        Consultant => "consultant",
        Admin => "admin",
    }
}

text_enum! {
    pub enum SessionType {
        Personal => "PERSONAL",
        Webinar => "WEBINAR",
    }
}

text_enum! {
    /// Lifecycle of one booking attempt.
    pub enum SessionStatus {
        Pending => "PENDING",
        Confirmed => "CONFIRMED",
        Ongoing => "ONGOING",
        Completed => "COMPLETED",
        Cancelled => "CANCELLED",
        Abandoned => "ABANDONED",
        NoShow => "NO_SHOW",
        Returned => "RETURNED",
    }
}

text_enum! {
    /// Status of a ledger entry. PENDING settles exactly once.
    pub enum PaymentStatus {
        Pending => "PENDING",
        Success => "SUCCESS",
        Failed => "FAILED",
        Refunded => "REFUNDED",
        PartiallyRefunded => "PARTIALLY_REFUNDED",
    }
}

text_enum! {
    /// Denormalized payment view carried on the session row for dashboards.
    pub enum SessionPaymentStatus {
        Unpaid => "UNPAID",
        Paid => "PAID",
        Failed => "FAILED",
        Refunded => "REFUNDED",
        PartiallyRefunded => "PARTIALLY_REFUNDED",
    }
}

text_enum! {
    pub enum TransactionKind {
        Payment => "PAYMENT",
        Refund => "REFUND",
    }
}

text_enum! {
    /// Which signal performed a settlement.
    pub enum SettlementSource {
        ClientVerification => "CLIENT_VERIFICATION",
        Webhook => "WEBHOOK",
        Reconciliation => "RECONCILIATION",
        ClientCancellation => "CLIENT_CANCELLATION",
        Expiry => "EXPIRY",
    }
}

impl PaymentStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, PaymentStatus::Pending)
    }
}

impl From<PaymentStatus> for SessionPaymentStatus {
    fn from(status: PaymentStatus) -> Self {
        match status {
            PaymentStatus::Pending => SessionPaymentStatus::Unpaid,
            PaymentStatus::Success => SessionPaymentStatus::Paid,
            PaymentStatus::Failed => SessionPaymentStatus::Failed,
            PaymentStatus::Refunded => SessionPaymentStatus::Refunded,
            PaymentStatus::PartiallyRefunded => SessionPaymentStatus::PartiallyRefunded,
        }
    }
}

// Common response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(code: &str, message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            error_code: Some(code.to_string()),
            timestamp: Utc::now(),
        }
    }
}

impl ApiResponse<serde_json::Value> {
    /// Error envelope that still carries a payload, e.g. the session id of a
    /// reservation whose order creation timed out.
    pub fn error_with_data(code: &str, message: String, data: serde_json::Value) -> Self {
        Self {
            success: false,
            data: Some(data),
            error: Some(message),
            error_code: Some(code.to_string()),
            timestamp: Utc::now(),
        }
    }
}
