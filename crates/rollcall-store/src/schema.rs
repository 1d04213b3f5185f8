use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS students (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            roll_number TEXT,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS schedules (
            date       TEXT PRIMARY KEY,
            periods    TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attendance (
            id           TEXT PRIMARY KEY,
            student_id   TEXT NOT NULL,
            student_name TEXT NOT NULL,
            roll_number  TEXT,
            date         TEXT NOT NULL,
            period       INTEGER,
            status       TEXT NOT NULL,
            time         TEXT NOT NULL,
            recorded_at  TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_period
            ON attendance(student_id, date, period) WHERE period IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        let version: String = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_partial_index_ignores_adhoc_rows() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        let insert = "INSERT INTO attendance
            (id, student_id, student_name, date, period, status, time, recorded_at)
            VALUES (?1, 'S1', 'Ada', '2024-05-01', ?2, 'present', '09:10:00', '')";
        conn.execute(insert, rusqlite::params!["a", None::<i64>]).unwrap();
        conn.execute(insert, rusqlite::params!["b", None::<i64>]).unwrap();
        conn.execute(insert, rusqlite::params!["c", 1]).unwrap();
        assert!(conn.execute(insert, rusqlite::params!["d", 1]).is_err());
    }
}
