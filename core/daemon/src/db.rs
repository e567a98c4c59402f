//! SQLite persistence for stagewatch-daemon.
//!
//! Two append-only tables: `events` (baseline, arm, alerts, advisory
//! decisions) and `observations` (sampled raw readings). Writes are
//! fire-and-forget from the frame loop; failures are logged here and never
//! reach the caller.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde_json::Value;
use std::path::PathBuf;

use stagewatch_core::{EventSink, ObservationSample};
use stagewatch_daemon_protocol::{EventRecord, ObservationRecord};

#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn insert_event(&self, event_type: &str, payload: &Value) -> Result<(), String> {
        let payload = serde_json::to_string(payload)
            .map_err(|err| format!("Failed to serialize event payload: {}", err))?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO events (ts_utc, event_type, payload_json) VALUES (?1, ?2, ?3)",
                params![now_rfc3339(), event_type, payload],
            )
            .map_err(|err| format!("Failed to insert event: {}", err))?;
            Ok(())
        })
    }

    pub fn insert_observation(&self, sample: &ObservationSample) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO observations \
                    (ts_utc, state, item_count, baseline_count, diff, avg_conf, streak) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    now_rfc3339(),
                    sample.state.as_str(),
                    sample.item_count,
                    sample.baseline_count,
                    sample.diff,
                    f64::from(sample.avg_conf),
                    sample.streak
                ],
            )
            .map_err(|err| format!("Failed to insert observation: {}", err))?;
            Ok(())
        })
    }

    /// Newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, ts_utc, event_type, payload_json FROM events \
                     ORDER BY id DESC LIMIT ?1",
                )
                .map_err(|err| format!("Failed to prepare events query: {}", err))?;

            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|err| format!("Failed to read event rows: {}", err))?;

            let mut events = Vec::new();
            for row in rows {
                let (id, ts_utc, event_type, payload) =
                    row.map_err(|err| format!("Failed to decode event row: {}", err))?;
                // A corrupt payload should not hide the rest of the log.
                let payload = serde_json::from_str(&payload).unwrap_or(Value::Null);
                events.push(EventRecord {
                    id,
                    ts_utc,
                    event_type,
                    payload,
                });
            }
            Ok(events)
        })
    }

    /// Newest first.
    pub fn recent_observations(&self, limit: usize) -> Result<Vec<ObservationRecord>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, ts_utc, state, item_count, baseline_count, diff, avg_conf, streak \
                     FROM observations ORDER BY id DESC LIMIT ?1",
                )
                .map_err(|err| format!("Failed to prepare observations query: {}", err))?;

            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(ObservationRecord {
                        id: row.get(0)?,
                        ts_utc: row.get(1)?,
                        state: row.get(2)?,
                        item_count: row.get(3)?,
                        baseline_count: row.get(4)?,
                        diff: row.get(5)?,
                        avg_conf: row.get(6)?,
                        streak: row.get(7)?,
                    })
                })
                .map_err(|err| format!("Failed to read observation rows: {}", err))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|err| format!("Failed to decode observation row: {}", err))
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ts_utc TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload_json TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS observations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ts_utc TEXT NOT NULL,
                    state TEXT NOT NULL,
                    item_count INTEGER NOT NULL,
                    baseline_count INTEGER,
                    diff INTEGER NOT NULL,
                    avg_conf REAL NOT NULL,
                    streak INTEGER NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

impl EventSink for Db {
    fn log_event(&self, event_type: &str, payload: Value) {
        if let Err(err) = self.insert_event(event_type, &payload) {
            tracing::warn!(error = %err, event_type, "Failed to persist event");
        }
    }

    fn log_observation(&self, sample: &ObservationSample) {
        if let Err(err) = self.insert_observation(sample) {
            tracing::warn!(error = %err, "Failed to persist observation");
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
