//! Turns weekly patterns and concrete slot rows into open, bookable slots.
//!
//! The resolver functions are pure: the same patterns, slot rows and clock
//! always produce the same sorted output. Only [`AvailabilityService`]
//! touches the store.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use consultbook_common::{AppError, SessionType};
use consultbook_database::{AvailabilitySlot, BookingStore, WeeklyAvailabilityPattern};

use crate::config::BookingRules;
use crate::error::BookingError;

/// `"HH:MM"` on the wire. Seconds are accepted on input and dropped.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpenSlot {
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub timezone: String,
}

impl OpenSlot {
    fn overlaps(&self, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> bool {
        self.date == date && self.start_time < end && start < self.end_time
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub now: DateTime<Utc>,
    pub min_lead: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityResponse {
    pub consultant_id: Uuid,
    pub session_type: SessionType,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub slots: Vec<OpenSlot>,
    pub by_date: BTreeMap<NaiveDate, Vec<OpenSlot>>,
}

/// Splits one pattern window into (start, end) pairs. Without `slot_minutes`
/// the whole window is a single slot; with it, only slots that fit entirely.
fn split_window(pattern: &WeeklyAvailabilityPattern) -> Vec<(NaiveTime, NaiveTime)> {
    let total = (pattern.end_time - pattern.start_time).num_minutes();
    if total <= 0 {
        return Vec::new();
    }
    let step = match pattern.slot_minutes {
        Some(minutes) if minutes > 0 => i64::from(minutes),
        _ => return vec![(pattern.start_time, pattern.end_time)],
    };

    (0..total / step)
        .map(|k| {
            let start = pattern.start_time + Duration::minutes(k * step);
            (start, start + Duration::minutes(step))
        })
        .collect()
}

fn localize(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    // Nonexistent local times (DST gap) yield nothing; ambiguous ones take the earlier instant.
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Every slot the patterns offer in `[from, to]`, sorted. Candidates whose
/// instants overlap are collapsed to the earliest one, whatever timezone
/// their patterns use.
pub fn candidate_slots(
    patterns: &[WeeklyAvailabilityPattern],
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<OpenSlot> {
    let mut candidates = Vec::new();

    for pattern in patterns.iter().filter(|p| p.is_active) {
        let tz: Tz = match pattern.timezone.parse() {
            Ok(tz) => tz,
            Err(_) => {
                tracing::warn!(pattern_id = %pattern.id, timezone = %pattern.timezone, "Skipping pattern with unknown timezone");
                continue;
            }
        };
        let windows = split_window(pattern);

        for date in from.iter_days().take_while(|d| *d <= to) {
            if date.weekday() != pattern.day_of_week {
                continue;
            }
            for (start, end) in &windows {
                let Some(starts_at) = localize(tz, date, *start) else {
                    continue;
                };
                candidates.push(OpenSlot {
                    date,
                    start_time: *start,
                    end_time: *end,
                    starts_at,
                    ends_at: starts_at + (*end - *start),
                    timezone: pattern.timezone.clone(),
                });
            }
        }
    }

    candidates.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then_with(|| a.cmp(b)));
    let mut kept: Vec<OpenSlot> = Vec::with_capacity(candidates.len());
    let mut keys = HashSet::new();
    let mut busy_until: Option<DateTime<Utc>> = None;
    for candidate in candidates {
        let overlaps_kept = busy_until.map_or(false, |end| candidate.starts_at < end);
        // Slot rows are keyed by local date and start, so a key is offered once.
        if overlaps_kept || !keys.insert((candidate.date, candidate.start_time)) {
            continue;
        }
        busy_until = busy_until.max(Some(candidate.ends_at));
        kept.push(candidate);
    }
    kept.sort();
    kept
}

/// Open slots for the window: candidates minus booked or blocked slot rows,
/// minus anything starting before `now + min_lead`.
pub fn resolve_open_slots(
    patterns: &[WeeklyAvailabilityPattern],
    slots: &[AvailabilitySlot],
    window: &ResolveWindow,
) -> Vec<OpenSlot> {
    let taken: Vec<&AvailabilitySlot> = slots
        .iter()
        .filter(|s| s.is_booked || s.is_blocked)
        .collect();
    let earliest_start = window.now + window.min_lead;

    candidate_slots(patterns, window.from, window.to)
        .into_iter()
        .filter(|c| c.starts_at >= earliest_start)
        .filter(|c| {
            !taken
                .iter()
                .any(|s| c.overlaps(s.slot_date, s.start_time, s.end_time))
        })
        .collect()
}

/// The candidate a reservation for `(date, start_time)` refers to, if the
/// patterns offer it and it is outside the lead-time buffer.
pub fn offered_slot(
    patterns: &[WeeklyAvailabilityPattern],
    date: NaiveDate,
    start_time: NaiveTime,
    now: DateTime<Utc>,
    min_lead: Duration,
) -> Option<OpenSlot> {
    let window = ResolveWindow {
        from: date,
        to: date,
        now,
        min_lead,
    };
    resolve_open_slots(patterns, &[], &window)
        .into_iter()
        .find(|slot| slot.start_time == start_time)
}

pub fn group_by_date(slots: &[OpenSlot]) -> BTreeMap<NaiveDate, Vec<OpenSlot>> {
    let mut grouped: BTreeMap<NaiveDate, Vec<OpenSlot>> = BTreeMap::new();
    for slot in slots {
        grouped.entry(slot.date).or_default().push(slot.clone());
    }
    grouped
}

pub fn validate_range(from: NaiveDate, to: NaiveDate, max_range_days: i64) -> Result<(), AppError> {
    if to < from {
        return Err(AppError::Validation("`to` must not be before `from`".to_string()));
    }
    let days = (to - from).num_days() + 1;
    if days > max_range_days {
        return Err(AppError::Validation(format!(
            "date range covers {} days, at most {} allowed",
            days, max_range_days
        )));
    }
    Ok(())
}

pub struct AvailabilityService {
    store: Arc<dyn BookingStore>,
    rules: BookingRules,
}

impl AvailabilityService {
    pub fn new(store: Arc<dyn BookingStore>, rules: BookingRules) -> Self {
        Self { store, rules }
    }

    pub async fn available_slots(
        &self,
        consultant_id: Uuid,
        session_type: SessionType,
        from: NaiveDate,
        to: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<AvailabilityResponse, BookingError> {
        validate_range(from, to, self.rules.max_range_days)?;

        if self.store.get_consultant(consultant_id).await?.is_none() {
            return Err(AppError::NotFound(format!("consultant {}", consultant_id)).into());
        }

        let patterns = self.store.list_active_patterns(consultant_id, session_type).await?;
        let slots = self.store.list_slots(consultant_id, session_type, from, to).await?;

        let window = ResolveWindow {
            from,
            to,
            now,
            min_lead: self.rules.min_lead(),
        };
        let open = resolve_open_slots(&patterns, &slots, &window);

        tracing::debug!(
            consultant_id = %consultant_id,
            session_type = %session_type,
            open = open.len(),
            "Resolved availability"
        );

        Ok(AvailabilityResponse {
            consultant_id,
            session_type,
            from,
            to,
            by_date: group_by_date(&open),
            slots: open,
        })
    }
}
