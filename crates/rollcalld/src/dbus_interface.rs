use std::sync::Arc;

use chrono::NaiveDate;
use rollcall_core::{Identity, IdentityRef, MarkOutcome, ScheduleDay};
use serde::Serialize;
use zbus::interface;

use crate::service::{AttendanceService, ServiceError};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Structured replies are JSON strings. Failures carry `Kind: message` in
/// an `org.freedesktop.DBus.Error.Failed` reply.
pub struct AttendanceInterface {
    service: Arc<AttendanceService>,
}

impl AttendanceInterface {
    pub fn new(service: Arc<AttendanceService>) -> Self {
        Self { service }
    }
}

fn failed(e: ServiceError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("{}: {e}", e.kind()))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("Internal: {e}")))
}

fn parse_date(raw: &str) -> zbus::fdo::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("invalid date {raw:?}, expected YYYY-MM-DD")))
}

fn optional(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceInterface {
    /// Enroll a face for a roster identity. An empty `roll` keeps the roster's.
    async fn enroll(&self, identity: &str, roll: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(identity, bytes = image.len(), "enroll requested");
        let enrolled = self
            .service
            .enroll(&IdentityRef::from(identity), optional(roll), image)
            .await
            .map_err(failed)?;
        to_json(&enrolled)
    }

    /// Identify a face and log an ad hoc attendance event.
    async fn recognize(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "recognize requested");
        let recognition = self.service.recognize(image).await.map_err(failed)?;
        to_json(&recognition)
    }

    /// Mark attendance for a scheduled period.
    async fn mark_period(&self, identity: &str, period: u32, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(identity, period, "mark_period requested");
        let outcome = self
            .service
            .mark_period(&IdentityRef::from(identity), period, image)
            .await
            .map_err(failed)?;
        let reply = match outcome {
            MarkOutcome::Marked(record) => serde_json::json!({
                "outcome": "Marked",
                "record": record,
            }),
            MarkOutcome::AlreadyMarked { identity, period } => serde_json::json!({
                "outcome": "AlreadyMarked",
                "identity": identity,
                "period": period,
            }),
        };
        Ok(reply.to_string())
    }

    /// Run the quality gate and diagnostic descriptor on an image.
    async fn diagnose(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let diagnosis = self.service.diagnose(image).await.map_err(failed)?;
        to_json(&diagnosis)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.status())
    }

    /// Re-read the profile store into the match index.
    async fn reload(&self) -> zbus::fdo::Result<u32> {
        let count = self.service.reload().map_err(failed)?;
        Ok(count as u32)
    }

    async fn upsert_student(&self, identity: &str, name: &str, roll: &str) -> zbus::fdo::Result<()> {
        tracing::info!(identity, "upsert_student requested");
        self.service
            .upsert_student(&Identity {
                id: IdentityRef::from(identity),
                name: name.to_string(),
                roll: optional(roll),
            })
            .map_err(failed)
    }

    /// Replace a day's schedule: `{"date": "YYYY-MM-DD", "periods": [{"period", "start", "end"}]}`.
    async fn set_schedule(&self, schedule_json: &str) -> zbus::fdo::Result<()> {
        let day: ScheduleDay = serde_json::from_str(schedule_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("schedule: {e}")))?;
        self.service.set_schedule(day).map_err(failed)
    }

    /// Schedule for a date, or `null`.
    async fn schedule(&self, date: &str) -> zbus::fdo::Result<String> {
        let schedule = self.service.schedule_for(parse_date(date)?).map_err(failed)?;
        to_json(&schedule)
    }

    /// Records for one identity on a date.
    async fn attendance(&self, identity: &str, date: &str) -> zbus::fdo::Result<String> {
        let records = self
            .service
            .attendance_for(&IdentityRef::from(identity), parse_date(date)?)
            .map_err(failed)?;
        to_json(&records)
    }

    /// Records on a date for every identity, keyed by identity.
    async fn attendance_on(&self, date: &str) -> zbus::fdo::Result<String> {
        let grouped = self.service.attendance_on(parse_date(date)?).map_err(failed)?;
        to_json(&grouped)
    }
}
