use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use rust_decimal::Decimal;
use consultbook_common::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consultant {
    pub id: Uuid,
    pub slug: String,
    pub display_name: String,
    pub owner_user_id: Uuid,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

/// Booking party. Clients are scoped per consultant and keyed by e-mail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub consultant_id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Recurring weekly template. Never booked directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklyAvailabilityPattern {
    pub id: Uuid,
    pub consultant_id: Uuid,
    pub session_type: SessionType,
    pub day_of_week: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    /// When set, the window is split into consecutive slots of this length.
    pub slot_minutes: Option<i32>,
    pub timezone: String,
    pub is_active: bool,
}

/// Identity of a concrete slot; unique in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub consultant_id: Uuid,
    pub session_type: SessionType,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub id: Uuid,
    pub consultant_id: Uuid,
    pub session_type: SessionType,
    pub slot_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub is_booked: bool,
    pub is_blocked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AvailabilitySlot {
    pub fn key(&self) -> SlotKey {
        SlotKey {
            consultant_id: self.consultant_id,
            session_type: self.session_type,
            date: self.slot_date,
            start_time: self.start_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub consultant_id: Uuid,
    pub client_id: Uuid,
    pub slot_id: Uuid,
    pub session_type: SessionType,
    pub scheduled_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timezone: String,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub amount: Decimal,
    pub currency: String,
    pub status: SessionStatus,
    pub payment_status: SessionPaymentStatus,
    pub reservation_expires_at: DateTime<Utc>,
    pub meeting_link: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            consultant_id: self.consultant_id,
            session_type: self.session_type,
            date: self.scheduled_date,
            start_time: self.start_time,
        }
    }

    pub fn reservation_expired(&self, now: DateTime<Utc>) -> bool {
        self.reservation_expires_at <= now
    }
}

/// Append-only ledger entry. Payments settle exactly once; refunds are
/// separate `Refund` rows pointing at the payment through `parent_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub session_id: Uuid,
    pub kind: TransactionKind,
    pub parent_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub gateway_refund_id: Option<String>,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub settled_by: Option<SettlementSource>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Day-of-week as stored: 0 = Monday .. 6 = Sunday.
pub fn weekday_to_index(day: Weekday) -> i16 {
    day.num_days_from_monday() as i16
}

pub fn weekday_from_index(index: i16) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}
