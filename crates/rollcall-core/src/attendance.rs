//! Attendance records and the rules that admit a period mark.
//!
//! Uniqueness of (identity, date, period) is not checked here: it belongs to
//! the storage layer, which must insert conditionally in one step. This
//! module decides whether a mark may be attempted at all.

use crate::schedule::{Period, ScheduleDay};
use crate::types::{Identity, IdentityRef};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
        }
    }
}

/// One attendance event. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub identity: IdentityRef,
    pub name: String,
    pub roll: Option<String>,
    pub date: NaiveDate,
    /// `None` for ad hoc (walk-up) recognition.
    pub period: Option<u32>,
    pub status: AttendanceStatus,
    /// Time of day, whole seconds.
    pub time: NaiveTime,
    pub recorded_at: DateTime<Utc>,
}

impl AttendanceRecord {
    pub fn present(identity: &Identity, period: Option<u32>, now: DateTime<Utc>) -> Self {
        let time = now.time();
        Self {
            id: Uuid::new_v4().to_string(),
            identity: identity.id.clone(),
            name: identity.name.clone(),
            roll: identity.roll.clone(),
            date: now.date_naive(),
            period,
            status: AttendanceStatus::Present,
            time: time.with_nanosecond(0).unwrap_or(time),
            recorded_at: now,
        }
    }
}

/// Outcome of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record for the same (identity, date, period) already existed; nothing was written.
    AlreadyPresent,
}

/// Result of a successful period mark. Both variants are success.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    Marked(AttendanceRecord),
    AlreadyMarked { identity: IdentityRef, period: u32 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdjudicationError {
    #[error("no schedule set for {0}")]
    ScheduleNotSet(NaiveDate),
    #[error("period {period} not found in the schedule for {date}")]
    PeriodNotFound { period: u32, date: NaiveDate },
    #[error("attendance for period {period} can only be marked between {} and {} (UTC)", .start.format("%H:%M"), .end.format("%H:%M"))]
    OutsideWindow {
        period: u32,
        start: NaiveTime,
        end: NaiveTime,
    },
}

/// Check that `period` may be marked at `now` under today's schedule.
///
/// `schedule` is the schedule for `now`'s date, if one exists. Returns the
/// matching period on success.
pub fn admit_period(
    schedule: Option<&ScheduleDay>,
    period: u32,
    now: NaiveDateTime,
) -> Result<&Period, AdjudicationError> {
    let date = now.date();
    let day = schedule
        .filter(|s| !s.periods.is_empty())
        .ok_or(AdjudicationError::ScheduleNotSet(date))?;

    let slot = day
        .period(period)
        .ok_or(AdjudicationError::PeriodNotFound { period, date })?;

    if !slot.contains(now.time()) {
        return Err(AdjudicationError::OutsideWindow {
            period,
            start: slot.start,
            end: slot.end,
        });
    }
    Ok(slot)
}

/// Source of the current time. All adjudication uses UTC.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
