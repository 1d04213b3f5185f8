//! Per-day class schedules.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("invalid time {0:?}: expected HH:MM")]
    InvalidTime(String),
    #[error("period {period} ends ({end}) before it starts ({start})")]
    InvertedWindow {
        period: u32,
        start: NaiveTime,
        end: NaiveTime,
    },
    #[error("period {0} listed more than once")]
    DuplicatePeriod(u32),
    #[error("schedule has no periods")]
    Empty,
}

/// One scheduled class period. Times are UTC wall-clock, minute precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub period: u32,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl Period {
    pub fn parse(period: u32, start: &str, end: &str) -> Result<Self, ScheduleError> {
        Ok(Self {
            period,
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
        })
    }

    /// Inclusive at both ends.
    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time <= self.end
    }
}

/// All periods for one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDay {
    pub date: NaiveDate,
    pub periods: Vec<Period>,
}

impl ScheduleDay {
    /// Build a validated schedule: non-empty, unique period numbers, and
    /// every window ending no earlier than it starts.
    pub fn new(date: NaiveDate, periods: Vec<Period>) -> Result<Self, ScheduleError> {
        if periods.is_empty() {
            return Err(ScheduleError::Empty);
        }
        for (i, p) in periods.iter().enumerate() {
            if p.end < p.start {
                return Err(ScheduleError::InvertedWindow {
                    period: p.period,
                    start: p.start,
                    end: p.end,
                });
            }
            if periods[..i].iter().any(|q| q.period == p.period) {
                return Err(ScheduleError::DuplicatePeriod(p.period));
            }
        }
        Ok(Self { date, periods })
    }

    pub fn period(&self, number: u32) -> Option<&Period> {
        self.periods.iter().find(|p| p.period == number)
    }
}

pub fn parse_hhmm(s: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| ScheduleError::InvalidTime(s.to_string()))
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_hhmm(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn test_period_window_inclusive() {
        let p = Period::parse(1, "09:00", "09:50").unwrap();
        assert!(p.contains(NaiveTime::from_hms_opt(9, 0, 0).unwrap()));
        assert!(p.contains(NaiveTime::from_hms_opt(9, 50, 0).unwrap()));
        assert!(!p.contains(NaiveTime::from_hms_opt(8, 59, 59).unwrap()));
        assert!(!p.contains(NaiveTime::from_hms_opt(9, 50, 1).unwrap()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(
            Period::parse(1, "nine", "09:50"),
            Err(ScheduleError::InvalidTime("nine".into()))
        );
        assert!(Period::parse(1, "09:00", "25:00").is_err());
    }

    #[test]
    fn test_schedule_validation() {
        let p1 = Period::parse(1, "09:00", "09:50").unwrap();
        let backwards = Period::parse(2, "11:00", "10:00").unwrap();
        assert!(matches!(
            ScheduleDay::new(date(), vec![p1.clone(), backwards]),
            Err(ScheduleError::InvertedWindow { period: 2, .. })
        ));
        assert_eq!(
            ScheduleDay::new(date(), vec![p1.clone(), p1.clone()]),
            Err(ScheduleError::DuplicatePeriod(1))
        );
        assert_eq!(ScheduleDay::new(date(), vec![]), Err(ScheduleError::Empty));

        let day = ScheduleDay::new(date(), vec![p1]).unwrap();
        assert_eq!(day.period(1).unwrap().start.to_string(), "09:00:00");
        assert!(day.period(2).is_none());
    }

    #[test]
    fn test_serde_uses_hhmm() {
        let day = ScheduleDay::new(date(), vec![Period::parse(1, "09:00", "09:50").unwrap()]).unwrap();
        let json = serde_json::to_string(&day).unwrap();
        assert_eq!(
            json,
            r#"{"date":"2024-05-01","periods":[{"period":1,"start":"09:00","end":"09:50"}]}"#
        );
        let back: ScheduleDay = serde_json::from_str(&json).unwrap();
        assert_eq!(back, day);

        let bad = r#"{"date":"2024-05-01","periods":[{"period":1,"start":"9am","end":"09:50"}]}"#;
        assert!(serde_json::from_str::<ScheduleDay>(bad).is_err());
    }
}
