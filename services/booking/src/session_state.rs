//! Allowed session status transitions.
//!
//! ```text
//! PENDING ──settle SUCCESS──▶ CONFIRMED ──start time──▶ ONGOING ──▶ COMPLETED
//!    │                           │  │                     │            │
//!    ├──▶ CANCELLED              │  └──────▶ NO_SHOW ◀────┘            │
//!    └──▶ ABANDONED              └──────────▶ RETURNED ◀───────────────┘
//! ```
//!
//! CONFIRMED is only reachable through payment settlement; the generic
//! transition path in the store refuses it as a target.

use consultbook_common::SessionStatus;

use crate::error::BookingError;

/// Statuses a session may be in for a move to `to`.
pub fn allowed_sources(to: SessionStatus) -> &'static [SessionStatus] {
    use SessionStatus::*;
    match to {
        Pending => &[],
        Confirmed => &[Pending],
        Ongoing => &[Confirmed],
        Completed => &[Ongoing],
        Cancelled => &[Pending],
        Abandoned => &[Pending],
        NoShow => &[Confirmed, Ongoing],
        Returned => &[Confirmed, Completed],
    }
}

pub fn can_transition(from: SessionStatus, to: SessionStatus) -> bool {
    allowed_sources(to).contains(&from)
}

pub fn ensure_transition(from: SessionStatus, to: SessionStatus) -> Result<(), BookingError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(BookingError::InvalidTransition { from, to })
    }
}

/// Targets a consultant may set explicitly.
pub fn is_markable(status: SessionStatus) -> bool {
    matches!(status, SessionStatus::Completed | SessionStatus::NoShow)
}
