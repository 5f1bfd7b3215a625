//! Persistence module for RadioGrab
//!
//! SQLite-backed store for show schedules, stream compatibility records and
//! finalized recordings. Every method holds the connection lock for one short
//! statement or transaction.

use crate::capture::CaptureTool;
use crate::compat::{CompatibilityStatus, StreamCompatibilityRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS shows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    stream_url TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    duration_secs INTEGER NOT NULL,
    retention_days INTEGER,
    retention_max_count INTEGER,
    last_tested_at INTEGER,
    last_test_result TEXT,
    last_error TEXT,
    recommended_tool TEXT,
    compatibility_status TEXT,
    test_payload TEXT,
    last_capture_at INTEGER,
    last_capture_status TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS show_airings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    show_id INTEGER NOT NULL REFERENCES shows(id) ON DELETE CASCADE,
    cron_expression TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS stream_compatibility (
    stream_url TEXT PRIMARY KEY,
    tested_at INTEGER NOT NULL,
    status TEXT NOT NULL,
    recommended_tool TEXT,
    results_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recordings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    show_id INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    recorded_at INTEGER NOT NULL,
    scheduled_start INTEGER NOT NULL,
    duration_secs REAL NOT NULL,
    size_bytes INTEGER NOT NULL,
    source_type TEXT NOT NULL,
    quality_valid INTEGER NOT NULL,
    UNIQUE(show_id, scheduled_start)
);

CREATE INDEX IF NOT EXISTS idx_airings_show ON show_airings(show_id);
CREATE INDEX IF NOT EXISTS idx_recordings_show ON recordings(show_id, scheduled_start);
"#;

/// Error type for persistence operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    /// A uniqueness or other constraint rejected the write
    #[error("Constraint violation: {0}")]
    Conflict(String),

    #[error("Database is busy or locked")]
    Busy,

    #[error("Corrupt row in {table} (id {id}): {reason}")]
    Corrupt {
        table: &'static str,
        id: i64,
        reason: String,
    },

    #[error("Database connection lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref err, ref msg) = e {
            match err.code {
                ErrorCode::ConstraintViolation => {
                    return StoreError::Conflict(msg.clone().unwrap_or_else(|| err.to_string()));
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => return StoreError::Busy,
                _ => {}
            }
        }
        StoreError::Sqlite(e)
    }
}

/// How a recording came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Scheduled,
    Test,
    Manual,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Scheduled => "scheduled",
            SourceType::Test => "test",
            SourceType::Manual => "manual",
        }
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SourceType::Scheduled),
            "test" => Ok(SourceType::Test),
            "manual" => Ok(SourceType::Manual),
            other => Err(format!("unknown source type '{}'", other)),
        }
    }
}

/// Per-show bound on kept recordings; `None` means unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_age_days: Option<u32>,
    pub max_count: Option<u32>,
}

/// One cron airing of a show
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiringRow {
    pub id: i64,
    pub cron_expression: String,
    pub description: String,
    pub active: bool,
}

/// A show with its airings, as read by the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct ShowSchedule {
    pub show_id: i64,
    pub name: String,
    pub stream_url: String,
    pub duration: Duration,
    pub active: bool,
    pub retention: Option<RetentionPolicy>,
    pub airings: Vec<AiringRow>,
}

/// Fields needed to register a show
#[derive(Debug, Clone)]
pub struct NewShow {
    pub name: String,
    pub stream_url: String,
    pub duration: Duration,
    pub retention: Option<RetentionPolicy>,
}

/// A recording about to be committed
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecording {
    pub show_id: i64,
    pub file_path: PathBuf,
    pub recorded_at: DateTime<Utc>,
    pub scheduled_start: i64,
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub source_type: SourceType,
    pub quality_valid: bool,
}

/// A committed recording
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recording {
    pub id: i64,
    pub show_id: i64,
    pub file_path: PathBuf,
    pub recorded_at: DateTime<Utc>,
    /// Unix seconds, rounded to the minute
    pub scheduled_start: i64,
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub source_type: SourceType,
    pub quality_valid: bool,
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Shared handle to the RadioGrab database
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database file and ensure the schema exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            ",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// In-memory database, used by tests and one-shot CLI commands
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn insert_show(&self, show: &NewShow) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO shows (name, stream_url, duration_secs, retention_days, retention_max_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                show.name,
                show.stream_url,
                show.duration.as_secs() as i64,
                show.retention.and_then(|r| r.max_age_days),
                show.retention.and_then(|r| r.max_count),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_airing(
        &self,
        show_id: i64,
        cron_expression: &str,
        description: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO show_airings (show_id, cron_expression, description) VALUES (?1, ?2, ?3)",
            params![show_id, cron_expression, description],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_show_active(&self, show_id: i64, active: bool) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE shows SET active = ?1 WHERE id = ?2",
            params![active, show_id],
        )?;
        Ok(())
    }

    pub fn set_airing_cron(
        &self,
        airing_id: i64,
        cron_expression: &str,
        description: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE show_airings SET cron_expression = ?1, description = ?2 WHERE id = ?3",
            params![cron_expression, description, airing_id],
        )?;
        Ok(())
    }

    /// Read one show with all of its airings, active or not
    pub fn get_show(&self, show_id: i64) -> Result<Option<ShowSchedule>, StoreError> {
        let conn = self.lock()?;
        let show = conn
            .query_row(
                "SELECT id, name, stream_url, duration_secs, active, retention_days, retention_max_count
                 FROM shows WHERE id = ?1",
                params![show_id],
                decode_show,
            )
            .optional()?;

        let Some(mut show) = show else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, cron_expression, description, active FROM show_airings
             WHERE show_id = ?1 ORDER BY id",
        )?;
        let airings = stmt.query_map(params![show_id], decode_airing)?;
        for airing in airings {
            show.airings.push(airing?);
        }
        Ok(Some(show))
    }

    /// Load every active show with its active airings.
    ///
    /// Rows that fail to decode are skipped and logged; they never abort the load.
    pub fn load_schedules(&self) -> Result<Vec<ShowSchedule>, StoreError> {
        let conn = self.lock()?;
        let mut shows = Vec::new();

        let mut stmt = conn.prepare(
            "SELECT id, name, stream_url, duration_secs, active, retention_days, retention_max_count
             FROM shows WHERE active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            Ok((id, decode_show(row)))
        })?;
        for row in rows {
            match row? {
                (_, Ok(show)) if show.stream_url.trim().is_empty() => {
                    warn!(show_id = show.show_id, "Skipping show with empty stream URL");
                }
                (_, Ok(show)) => shows.push(show),
                (id, Err(e)) => {
                    let err = StoreError::Corrupt {
                        table: "shows",
                        id,
                        reason: e.to_string(),
                    };
                    warn!(show_id = id, error = %err, "Skipping corrupt show row");
                }
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, cron_expression, description, active FROM show_airings
             WHERE show_id = ?1 AND active = 1 ORDER BY id",
        )?;
        for show in shows.iter_mut() {
            let airings = stmt.query_map(params![show.show_id], |row| {
                let id: i64 = row.get(0)?;
                Ok((id, decode_airing(row)))
            })?;
            for airing in airings {
                match airing? {
                    (_, Ok(a)) => show.airings.push(a),
                    (id, Err(e)) => {
                        warn!(show_id = show.show_id, airing_id = id, error = %e, "Skipping corrupt airing row");
                    }
                }
            }
        }

        Ok(shows)
    }

    /// Retention policy of every show, including inactive ones
    pub fn retention_policies(&self) -> Result<Vec<(i64, Option<RetentionPolicy>)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, retention_days, retention_max_count FROM shows")?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let days: Option<u32> = row.get(1)?;
            let count: Option<u32> = row.get(2)?;
            let policy = if days.is_none() && count.is_none() {
                None
            } else {
                Some(RetentionPolicy {
                    max_age_days: days,
                    max_count: count,
                })
            };
            Ok((id, policy))
        })?;
        rows.map(|r| r.map_err(StoreError::from)).collect()
    }

    pub fn get_compatibility(
        &self,
        stream_url: &str,
    ) -> Result<Option<StreamCompatibilityRecord>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT rowid, tested_at, status, recommended_tool, results_json
                 FROM stream_compatibility WHERE stream_url = ?1",
                params![stream_url],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((rowid, tested_at, status, recommended, results_json)) = row else {
            return Ok(None);
        };
        let corrupt = |reason: String| StoreError::Corrupt {
            table: "stream_compatibility",
            id: rowid,
            reason,
        };

        let status = CompatibilityStatus::from_str(&status).map_err(corrupt)?;
        let recommended_tool = recommended
            .as_deref()
            .map(CaptureTool::from_str)
            .transpose()
            .map_err(corrupt)?;
        let results = serde_json::from_str(&results_json).map_err(|e| corrupt(e.to_string()))?;

        Ok(Some(StreamCompatibilityRecord {
            stream_url: stream_url.to_string(),
            tested_at: from_unix(tested_at),
            status,
            recommended_tool,
            results,
        }))
    }

    /// Persist a compatibility record and write its verification fields back
    /// to every show using the stream.
    pub fn save_compatibility(&self, record: &StreamCompatibilityRecord) -> Result<(), StoreError> {
        let results_json =
            serde_json::to_string(&record.results).map_err(|e| StoreError::Corrupt {
                table: "stream_compatibility",
                id: 0,
                reason: e.to_string(),
            })?;
        let recommended = record.recommended_tool.map(|t| t.as_str());
        let last_error = record.error_summary();
        let last_result = if record.status == CompatibilityStatus::Failed {
            "failed"
        } else {
            "success"
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO stream_compatibility (stream_url, tested_at, status, recommended_tool, results_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(stream_url) DO UPDATE SET
                tested_at = excluded.tested_at,
                status = excluded.status,
                recommended_tool = excluded.recommended_tool,
                results_json = excluded.results_json",
            params![
                record.stream_url,
                record.tested_at.timestamp(),
                record.status.as_str(),
                recommended,
                results_json,
            ],
        )?;
        tx.execute(
            "UPDATE shows SET
                last_tested_at = ?1,
                last_test_result = ?2,
                last_error = ?3,
                recommended_tool = ?4,
                compatibility_status = ?5,
                test_payload = ?6
             WHERE stream_url = ?7",
            params![
                record.tested_at.timestamp(),
                last_result,
                last_error,
                recommended,
                record.status.as_str(),
                results_json,
                record.stream_url,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Stream URLs of active shows whose record is missing, older than `ttl`, or failed
    pub fn streams_needing_retest(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let cutoff = now.timestamp() - ttl.as_secs() as i64;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT s.stream_url FROM shows s
             LEFT JOIN stream_compatibility c ON c.stream_url = s.stream_url
             WHERE s.active = 1
               AND (c.stream_url IS NULL OR c.tested_at < ?1 OR c.status = 'failed')
             ORDER BY s.stream_url",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
        rows.map(|r| r.map_err(StoreError::from)).collect()
    }

    /// Update the rolling capture status that drives a station's health indicator
    pub fn record_capture_outcome(
        &self,
        show_id: i64,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        match error {
            None => conn.execute(
                "UPDATE shows SET last_capture_at = ?1, last_capture_status = 'success',
                    consecutive_failures = 0 WHERE id = ?2",
                params![at.timestamp(), show_id],
            )?,
            Some(msg) => conn.execute(
                "UPDATE shows SET last_capture_at = ?1, last_capture_status = 'failed',
                    last_error = ?2, consecutive_failures = consecutive_failures + 1
                 WHERE id = ?3",
                params![at.timestamp(), msg, show_id],
            )?,
        };
        Ok(())
    }

    /// Consecutive failed captures of a show, 0 after any success
    pub fn consecutive_failures(&self, show_id: i64) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        let n = conn
            .query_row(
                "SELECT consecutive_failures FROM shows WHERE id = ?1",
                params![show_id],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        Ok(n.unwrap_or(0))
    }

    pub fn recording_exists(&self, show_id: i64, scheduled_start: i64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM recordings WHERE show_id = ?1 AND scheduled_start = ?2",
                params![show_id, scheduled_start],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a recording row; a duplicate (show, scheduled start) is `StoreError::Conflict`
    pub fn insert_recording(&self, rec: &NewRecording) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO recordings
                (show_id, file_path, recorded_at, scheduled_start, duration_secs, size_bytes, source_type, quality_valid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rec.show_id,
                rec.file_path.to_string_lossy(),
                rec.recorded_at.timestamp(),
                rec.scheduled_start,
                rec.duration_secs,
                rec.size_bytes as i64,
                rec.source_type.as_str(),
                rec.quality_valid,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Recordings of one show, oldest scheduled start first
    pub fn list_recordings(&self, show_id: i64) -> Result<Vec<Recording>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, show_id, file_path, recorded_at, scheduled_start, duration_secs,
                    size_bytes, source_type, quality_valid
             FROM recordings WHERE show_id = ?1 ORDER BY scheduled_start ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![show_id], |row| {
            let source: String = row.get(7)?;
            let source_type = SourceType::from_str(&source).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?;
            Ok(Recording {
                id: row.get(0)?,
                show_id: row.get(1)?,
                file_path: PathBuf::from(row.get::<_, String>(2)?),
                recorded_at: from_unix(row.get(3)?),
                scheduled_start: row.get(4)?,
                duration_secs: row.get(5)?,
                size_bytes: row.get::<_, i64>(6)?.max(0) as u64,
                source_type,
                quality_valid: row.get(8)?,
            })
        })?;
        rows.map(|r| r.map_err(StoreError::from)).collect()
    }

    pub fn delete_recording(&self, recording_id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM recordings WHERE id = ?1", params![recording_id])?;
        Ok(())
    }

    /// File paths of every committed recording
    pub fn recording_paths(&self) -> Result<HashSet<PathBuf>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT file_path FROM recordings")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.map(|r| r.map(PathBuf::from).map_err(StoreError::from))
            .collect()
    }
}

fn decode_show(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShowSchedule> {
    let duration_secs: i64 = row.get(3)?;
    if duration_secs <= 0 {
        return Err(rusqlite::Error::IntegralValueOutOfRange(3, duration_secs));
    }
    let days: Option<u32> = row.get(5)?;
    let count: Option<u32> = row.get(6)?;
    let retention = if days.is_none() && count.is_none() {
        None
    } else {
        Some(RetentionPolicy {
            max_age_days: days,
            max_count: count,
        })
    };
    Ok(ShowSchedule {
        show_id: row.get(0)?,
        name: row.get(1)?,
        stream_url: row.get(2)?,
        duration: Duration::from_secs(duration_secs as u64),
        active: row.get(4)?,
        retention,
        airings: Vec::new(),
    })
}

fn decode_airing(row: &rusqlite::Row<'_>) -> rusqlite::Result<AiringRow> {
    Ok(AiringRow {
        id: row.get(0)?,
        cron_expression: row.get(1)?,
        description: row.get(2)?,
        active: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::CaptureToolResult;

    fn show(name: &str, url: &str) -> NewShow {
        NewShow {
            name: name.to_string(),
            stream_url: url.to_string(),
            duration: Duration::from_secs(3600),
            retention: None,
        }
    }

    fn recording(show_id: i64, start: i64) -> NewRecording {
        NewRecording {
            show_id,
            file_path: PathBuf::from(format!("/rec/{}_{}.mp3", show_id, start)),
            recorded_at: from_unix(start + 3600),
            scheduled_start: start,
            duration_secs: 3600.0,
            size_bytes: 46_000_000,
            source_type: SourceType::Scheduled,
            quality_valid: true,
        }
    }

    #[test]
    fn test_load_schedules_returns_active_shows_and_airings() {
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_show(&show("Jazz Hour", "http://a/stream")).unwrap();
        let b = store.insert_show(&show("Talk", "http://b/stream")).unwrap();
        store.insert_airing(a, "0 19 * * 2", "Every Tuesday at 7:00 PM").unwrap();
        store.insert_airing(a, "0 21 * * 4", "Every Thursday at 9:00 PM").unwrap();
        store.insert_airing(b, "0 8 * * 1-5", "Weekdays at 8:00 AM").unwrap();
        store.set_show_active(b, false).unwrap();

        let schedules = store.load_schedules().unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].show_id, a);
        assert_eq!(schedules[0].airings.len(), 2);
        assert_eq!(schedules[0].duration, Duration::from_secs(3600));
    }

    #[test]
    fn test_corrupt_show_row_is_skipped() {
        let store = Store::open_in_memory().unwrap();
        let good = store.insert_show(&show("Good", "http://good")).unwrap();
        store.insert_airing(good, "0 19 * * 2", "").unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO shows (name, stream_url, duration_secs) VALUES ('Bad', 'http://bad', 'forever')",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO shows (name, stream_url, duration_secs) VALUES ('Zero', 'http://zero', 0)",
                [],
            )
            .unwrap();
        }

        let schedules = store.load_schedules().unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].name, "Good");
    }

    #[test]
    fn test_duplicate_recording_is_typed_conflict() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_show(&show("Jazz", "http://a")).unwrap();
        store.insert_recording(&recording(id, 1_700_000_040)).unwrap();

        let err = store.insert_recording(&recording(id, 1_700_000_040)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {:?}", err);
        assert!(store.recording_exists(id, 1_700_000_040).unwrap());
        assert!(!store.recording_exists(id, 1_700_000_100).unwrap());
    }

    #[test]
    fn test_list_and_delete_recordings_oldest_first() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_show(&show("Jazz", "http://a")).unwrap();
        store.insert_recording(&recording(id, 300)).unwrap();
        store.insert_recording(&recording(id, 100)).unwrap();
        store.insert_recording(&recording(id, 200)).unwrap();

        let recs = store.list_recordings(id).unwrap();
        let starts: Vec<i64> = recs.iter().map(|r| r.scheduled_start).collect();
        assert_eq!(starts, vec![100, 200, 300]);

        store.delete_recording(recs[0].id).unwrap();
        assert_eq!(store.list_recordings(id).unwrap().len(), 2);
        assert_eq!(store.recording_paths().unwrap().len(), 2);
    }

    #[test]
    fn test_compatibility_round_trip_and_write_back() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_show(&show("Jazz", "http://a")).unwrap();
        let record = StreamCompatibilityRecord {
            stream_url: "http://a".to_string(),
            tested_at: from_unix(1_700_000_000),
            status: CompatibilityStatus::Good,
            recommended_tool: Some(CaptureTool::Ffmpeg),
            results: vec![
                CaptureToolResult::failed(CaptureTool::Streamripper, 0.4, "connection refused"),
                CaptureToolResult {
                    tool: CaptureTool::Ffmpeg,
                    success: true,
                    bytes: 160_000,
                    elapsed_secs: 10.1,
                    score: 98,
                    error: None,
                },
            ],
        };
        store.save_compatibility(&record).unwrap();

        let loaded = store.get_compatibility("http://a").unwrap().unwrap();
        assert_eq!(loaded, record);

        let conn = store.conn.lock().unwrap();
        let (tool, status): (String, String) = conn
            .query_row(
                "SELECT recommended_tool, compatibility_status FROM shows WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(tool, "ffmpeg");
        assert_eq!(status, "good");
    }

    #[test]
    fn test_streams_needing_retest() {
        let store = Store::open_in_memory().unwrap();
        store.insert_show(&show("Fresh", "http://fresh")).unwrap();
        store.insert_show(&show("Stale", "http://stale")).unwrap();
        store.insert_show(&show("Never", "http://never")).unwrap();
        let now = from_unix(1_700_100_000);

        for (url, age) in [("http://fresh", 60), ("http://stale", 90_000)] {
            store
                .save_compatibility(&StreamCompatibilityRecord {
                    stream_url: url.to_string(),
                    tested_at: from_unix(now.timestamp() - age),
                    status: CompatibilityStatus::Excellent,
                    recommended_tool: Some(CaptureTool::Ffmpeg),
                    results: vec![],
                })
                .unwrap();
        }

        let due = store
            .streams_needing_retest(now, Duration::from_secs(24 * 3600))
            .unwrap();
        assert_eq!(due, vec!["http://never".to_string(), "http://stale".to_string()]);
    }

    #[test]
    fn test_record_capture_outcome_tracks_failures() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_show(&show("Jazz", "http://a")).unwrap();
        let now = from_unix(1_700_000_000);
        store.record_capture_outcome(id, now, Some("all tools failed")).unwrap();
        store.record_capture_outcome(id, now, Some("all tools failed")).unwrap();
        assert_eq!(store.consecutive_failures(id).unwrap(), 2);
        store.record_capture_outcome(id, now, None).unwrap();
        assert_eq!(store.consecutive_failures(id).unwrap(), 0);
    }

    #[test]
    fn test_get_show_includes_inactive_airings() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_show(&NewShow {
                retention: Some(RetentionPolicy {
                    max_age_days: Some(7),
                    max_count: None,
                }),
                ..show("Jazz", "http://a")
            })
            .unwrap();
        let airing = store.insert_airing(id, "0 19 * * 2", "").unwrap();
        store.set_airing_cron(airing, "30 19 * * 2", "Every Tuesday at 7:30 PM").unwrap();

        let loaded = store.get_show(id).unwrap().unwrap();
        assert_eq!(loaded.airings[0].cron_expression, "30 19 * * 2");
        assert_eq!(loaded.retention.unwrap().max_age_days, Some(7));
        assert!(store.get_show(9999).unwrap().is_none());
    }
}
