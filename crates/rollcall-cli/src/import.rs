//! Roster and schedule files.
//!
//! Both are TOML. A roster lists `[[students]]` with `id`, `name` and an
//! optional `roll`; a schedule has a `date` and `[[periods]]` with `period`,
//! `start` and `end` as `HH:MM` (UTC).

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct RosterFile {
    pub students: Vec<Student>,
}

#[derive(Debug, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub roll: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ScheduleFile {
    pub date: String,
    pub periods: Vec<PeriodEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PeriodEntry {
    pub period: u32,
    pub start: String,
    pub end: String,
}

pub fn parse_roster(text: &str) -> Result<RosterFile> {
    let roster: RosterFile = toml::from_str(text).context("parsing roster")?;
    for s in &roster.students {
        if s.id.trim().is_empty() {
            bail!("student {:?} has an empty id", s.name);
        }
    }
    Ok(roster)
}

/// Parse and check a schedule file, returning the JSON the daemon expects.
pub fn parse_schedule(text: &str) -> Result<String> {
    let schedule: ScheduleFile = toml::from_str(text).context("parsing schedule")?;

    NaiveDate::parse_from_str(&schedule.date, "%Y-%m-%d")
        .with_context(|| format!("invalid date {:?}, expected YYYY-MM-DD", schedule.date))?;
    if schedule.periods.is_empty() {
        bail!("schedule for {} has no periods", schedule.date);
    }
    for p in &schedule.periods {
        let start = hhmm(&p.start)?;
        let end = hhmm(&p.end)?;
        if end < start {
            bail!("period {} ends ({}) before it starts ({})", p.period, p.end, p.start);
        }
    }

    Ok(serde_json::to_string(&schedule)?)
}

fn hhmm(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .with_context(|| format!("invalid time {raw:?}, expected HH:MM"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roster() {
        let roster = parse_roster(
            r#"
            [[students]]
            id = "S1"
            name = "Ada"
            roll = "42"

            [[students]]
            id = "S2"
            name = "Grace"
            "#,
        )
        .unwrap();
        assert_eq!(roster.students.len(), 2);
        assert_eq!(roster.students[0].roll.as_deref(), Some("42"));
        assert!(roster.students[1].roll.is_none());
    }

    #[test]
    fn test_roster_requires_id() {
        let err = parse_roster("[[students]]\nid = \" \"\nname = \"Ada\"\n").unwrap_err();
        assert!(err.to_string().contains("empty id"));
    }

    #[test]
    fn test_parse_schedule_to_json() {
        let json = parse_schedule(
            r#"
            date = "2024-05-01"

            [[periods]]
            period = 1
            start = "09:00"
            end = "09:50"
            "#,
        )
        .unwrap();
        assert_eq!(
            json,
            r#"{"date":"2024-05-01","periods":[{"period":1,"start":"09:00","end":"09:50"}]}"#
        );
    }

    #[test]
    fn test_schedule_rejects_bad_entries() {
        let bad_time = "date = \"2024-05-01\"\n[[periods]]\nperiod = 1\nstart = \"9am\"\nend = \"09:50\"\n";
        assert!(parse_schedule(bad_time).is_err());

        let inverted = "date = \"2024-05-01\"\n[[periods]]\nperiod = 1\nstart = \"10:00\"\nend = \"09:50\"\n";
        assert!(parse_schedule(inverted).unwrap_err().to_string().contains("before it starts"));

        let bad_date = "date = \"01/05/2024\"\n[[periods]]\nperiod = 1\nstart = \"09:00\"\nend = \"09:50\"\n";
        assert!(parse_schedule(bad_date).is_err());

        assert!(parse_schedule("date = \"2024-05-01\"\nperiods = []\n").is_err());
    }
}
