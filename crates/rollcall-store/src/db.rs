use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rollcall_core::{
    AttendanceRecord, AttendanceStatus, Identity, IdentityRef, InsertOutcome, Period, ScheduleDay,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, StoreError};
use crate::schema;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

const RECORD_COLUMNS: &str =
    "id, student_id, student_name, roll_number, date, period, status, time, recorded_at";

/// SQLite-backed roster, schedules and attendance log.
///
/// A single connection behind a mutex; every operation is one statement or
/// one transaction, so callers on different threads never interleave.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- roster ---

    pub fn upsert_student(&self, student: &Identity) -> Result<()> {
        self.conn().execute(
            "INSERT INTO students (id, name, roll_number, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                roll_number = excluded.roll_number,
                updated_at = excluded.updated_at",
            params![
                student.id.as_str(),
                student.name,
                student.roll,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn lookup(&self, id: &IdentityRef) -> Result<Option<Identity>> {
        let found = self
            .conn()
            .query_row(
                "SELECT id, name, roll_number FROM students WHERE id = ?1",
                [id.as_str()],
                |row| {
                    Ok(Identity {
                        id: IdentityRef(row.get(0)?),
                        name: row.get(1)?,
                        roll: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    pub fn list_students(&self) -> Result<Vec<Identity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, roll_number FROM students ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Identity {
                id: IdentityRef(row.get(0)?),
                name: row.get(1)?,
                roll: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- schedules ---

    /// Replace the schedule for `day.date`.
    pub fn set_schedule(&self, day: &ScheduleDay) -> Result<()> {
        let periods = serde_json::to_string(&day.periods)?;
        self.conn().execute(
            "INSERT INTO schedules (date, periods, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(date) DO UPDATE SET
                periods = excluded.periods,
                updated_at = excluded.updated_at",
            params![
                day.date.format(DATE_FORMAT).to_string(),
                periods,
                Utc::now().to_rfc3339()
            ],
        )?;
        tracing::debug!(date = %day.date, periods = day.periods.len(), "schedule stored");
        Ok(())
    }

    pub fn schedule_for(&self, date: NaiveDate) -> Result<Option<ScheduleDay>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT periods FROM schedules WHERE date = ?1",
                [date.format(DATE_FORMAT).to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            None => Ok(None),
            Some(json) => {
                let periods: Vec<Period> = serde_json::from_str(&json)?;
                Ok(Some(ScheduleDay::new(date, periods)?))
            }
        }
    }

    // --- attendance ---

    /// Insert a period record unless one already exists for the same
    /// (identity, date, period). Check and write happen in one statement.
    pub fn insert_period_record(&self, record: &AttendanceRecord) -> Result<InsertOutcome> {
        let period = record.period.ok_or_else(|| {
            StoreError::InvalidData("period record without a period number".into())
        })?;

        let changed = self.conn().execute(
            "INSERT INTO attendance
                (id, student_id, student_name, roll_number, date, period, status, time, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(student_id, date, period) WHERE period IS NOT NULL DO NOTHING",
            params![
                record.id,
                record.identity.as_str(),
                record.name,
                record.roll,
                record.date.format(DATE_FORMAT).to_string(),
                period,
                record.status.as_str(),
                record.time.format(TIME_FORMAT).to_string(),
                record.recorded_at.to_rfc3339(),
            ],
        )?;

        Ok(if changed == 0 {
            InsertOutcome::AlreadyPresent
        } else {
            InsertOutcome::Inserted
        })
    }

    /// Append a walk-up recognition record. These carry no period and are
    /// never deduplicated.
    pub fn insert_adhoc_record(&self, record: &AttendanceRecord) -> Result<()> {
        if record.period.is_some() {
            return Err(StoreError::InvalidData(
                "ad hoc record must not carry a period".into(),
            ));
        }
        self.conn().execute(
            "INSERT INTO attendance
                (id, student_id, student_name, roll_number, date, period, status, time, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8)",
            params![
                record.id,
                record.identity.as_str(),
                record.name,
                record.roll,
                record.date.format(DATE_FORMAT).to_string(),
                record.status.as_str(),
                record.time.format(TIME_FORMAT).to_string(),
                record.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All records for one identity on one date, oldest first.
    pub fn attendance_for(&self, id: &IdentityRef, date: NaiveDate) -> Result<Vec<AttendanceRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM attendance
             WHERE student_id = ?1 AND date = ?2
             ORDER BY recorded_at, rowid"
        ))?;
        let rows = stmt.query_map(
            params![id.as_str(), date.format(DATE_FORMAT).to_string()],
            RawRecord::from_row,
        )?;
        rows.map(|r| r?.into_record()).collect()
    }

    /// All records on one date, grouped by identity.
    pub fn attendance_on(&self, date: NaiveDate) -> Result<BTreeMap<IdentityRef, Vec<AttendanceRecord>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM attendance
             WHERE date = ?1
             ORDER BY student_id, recorded_at, rowid"
        ))?;
        let rows = stmt.query_map([date.format(DATE_FORMAT).to_string()], RawRecord::from_row)?;

        let mut grouped: BTreeMap<IdentityRef, Vec<AttendanceRecord>> = BTreeMap::new();
        for row in rows {
            let record = row?.into_record()?;
            grouped.entry(record.identity.clone()).or_default().push(record);
        }
        Ok(grouped)
    }
}

/// Column values as stored, before parsing dates and times.
struct RawRecord {
    id: String,
    identity: String,
    name: String,
    roll: Option<String>,
    date: String,
    period: Option<u32>,
    status: String,
    time: String,
    recorded_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identity: row.get(1)?,
            name: row.get(2)?,
            roll: row.get(3)?,
            date: row.get(4)?,
            period: row.get(5)?,
            status: row.get(6)?,
            time: row.get(7)?,
            recorded_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<AttendanceRecord> {
        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
            .map_err(|e| StoreError::InvalidData(format!("date {:?}: {e}", self.date)))?;
        let time = NaiveTime::parse_from_str(&self.time, TIME_FORMAT)
            .map_err(|e| StoreError::InvalidData(format!("time {:?}: {e}", self.time)))?;
        let recorded_at = DateTime::parse_from_rfc3339(&self.recorded_at)
            .map_err(|e| StoreError::InvalidData(format!("timestamp {:?}: {e}", self.recorded_at)))?
            .with_timezone(&Utc);
        let status = match self.status.as_str() {
            "present" => AttendanceStatus::Present,
            other => return Err(StoreError::InvalidData(format!("status {other:?}"))),
        };

        Ok(AttendanceRecord {
            id: self.id,
            identity: IdentityRef(self.identity),
            name: self.name,
            roll: self.roll,
            date,
            period: self.period,
            status,
            time,
            recorded_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ada() -> Identity {
        Identity {
            id: IdentityRef::from("S1"),
            name: "Ada".into(),
            roll: Some("42".into()),
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn may_first() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn test_roster_upsert_and_lookup() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.lookup(&IdentityRef::from("S1")).unwrap().is_none());

        db.upsert_student(&ada()).unwrap();
        assert_eq!(db.lookup(&IdentityRef::from("S1")).unwrap(), Some(ada()));

        let renamed = Identity {
            name: "Ada Lovelace".into(),
            ..ada()
        };
        db.upsert_student(&renamed).unwrap();
        assert_eq!(db.lookup(&IdentityRef::from("S1")).unwrap(), Some(renamed));
        assert_eq!(db.list_students().unwrap().len(), 1);
    }

    #[test]
    fn test_schedule_replace() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.schedule_for(may_first()).unwrap().is_none());

        let first = ScheduleDay::new(may_first(), vec![Period::parse(1, "09:00", "09:50").unwrap()]).unwrap();
        db.set_schedule(&first).unwrap();
        assert_eq!(db.schedule_for(may_first()).unwrap(), Some(first));

        let second = ScheduleDay::new(
            may_first(),
            vec![
                Period::parse(1, "08:00", "08:45").unwrap(),
                Period::parse(2, "09:00", "09:45").unwrap(),
            ],
        )
        .unwrap();
        db.set_schedule(&second).unwrap();
        assert_eq!(db.schedule_for(may_first()).unwrap(), Some(second));

        let other_day = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        assert!(db.schedule_for(other_day).unwrap().is_none());
    }

    #[test]
    fn test_period_record_inserted_once() {
        let db = Database::open_in_memory().unwrap();
        let first = AttendanceRecord::present(&ada(), Some(1), at(9, 10));
        let second = AttendanceRecord::present(&ada(), Some(1), at(9, 20));

        assert_eq!(db.insert_period_record(&first).unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            db.insert_period_record(&second).unwrap(),
            InsertOutcome::AlreadyPresent
        );

        let stored = db.attendance_for(&ada().id, may_first()).unwrap();
        assert_eq!(stored, vec![first]);
    }

    #[test]
    fn test_distinct_periods_both_recorded() {
        let db = Database::open_in_memory().unwrap();
        let p1 = AttendanceRecord::present(&ada(), Some(1), at(9, 10));
        let p2 = AttendanceRecord::present(&ada(), Some(2), at(10, 10));
        assert_eq!(db.insert_period_record(&p1).unwrap(), InsertOutcome::Inserted);
        assert_eq!(db.insert_period_record(&p2).unwrap(), InsertOutcome::Inserted);
        assert_eq!(db.attendance_for(&ada().id, may_first()).unwrap().len(), 2);
    }

    #[test]
    fn test_adhoc_records_not_deduplicated() {
        let db = Database::open_in_memory().unwrap();
        db.insert_adhoc_record(&AttendanceRecord::present(&ada(), None, at(8, 0)))
            .unwrap();
        db.insert_adhoc_record(&AttendanceRecord::present(&ada(), None, at(8, 5)))
            .unwrap();
        // A period mark is independent of walk-up records.
        let p1 = AttendanceRecord::present(&ada(), Some(1), at(9, 10));
        assert_eq!(db.insert_period_record(&p1).unwrap(), InsertOutcome::Inserted);

        let stored = db.attendance_for(&ada().id, may_first()).unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored.iter().filter(|r| r.period.is_none()).count(), 2);
    }

    #[test]
    fn test_record_kind_mismatch_rejected() {
        let db = Database::open_in_memory().unwrap();
        let adhoc = AttendanceRecord::present(&ada(), None, at(8, 0));
        let period = AttendanceRecord::present(&ada(), Some(1), at(9, 10));
        assert!(matches!(
            db.insert_period_record(&adhoc),
            Err(StoreError::InvalidData(_))
        ));
        assert!(matches!(
            db.insert_adhoc_record(&period),
            Err(StoreError::InvalidData(_))
        ));
    }

    #[test]
    fn test_attendance_on_groups_by_identity() {
        let db = Database::open_in_memory().unwrap();
        let grace = Identity {
            id: IdentityRef::from("S2"),
            name: "Grace".into(),
            roll: None,
        };
        db.insert_period_record(&AttendanceRecord::present(&ada(), Some(1), at(9, 10)))
            .unwrap();
        db.insert_period_record(&AttendanceRecord::present(&grace, Some(1), at(9, 12)))
            .unwrap();
        db.insert_adhoc_record(&AttendanceRecord::present(&grace, None, at(12, 0)))
            .unwrap();

        let day = db.attendance_on(may_first()).unwrap();
        assert_eq!(day.len(), 2);
        assert_eq!(day[&IdentityRef::from("S1")].len(), 1);
        assert_eq!(day[&IdentityRef::from("S2")].len(), 2);
        assert_eq!(day[&IdentityRef::from("S2")][0].roll, None);

        let next_day = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        assert!(db.attendance_on(next_day).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_marks_insert_exactly_once() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    let rec = AttendanceRecord::present(&ada(), Some(1), at(9, 10 + i));
                    db.insert_period_record(&rec).unwrap()
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let inserted = outcomes
            .iter()
            .filter(|o| **o == InsertOutcome::Inserted)
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(db.attendance_for(&ada().id, may_first()).unwrap().len(), 1);
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rollcall.db");
        {
            let db = Database::open(&path).unwrap();
            db.upsert_student(&ada()).unwrap();
            db.insert_period_record(&AttendanceRecord::present(&ada(), Some(1), at(9, 10)))
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.lookup(&ada().id).unwrap(), Some(ada()));
        assert_eq!(db.attendance_for(&ada().id, may_first()).unwrap().len(), 1);
    }
}
