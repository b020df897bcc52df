use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::MetadataBackend;
use sluice_core::types::{MetricEntry, ParamEntry, RunId, RunRecord, TagEntry};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        epoch INTEGER NOT NULL DEFAULT 0,
        started_at TEXT NOT NULL,
        ended_at TEXT
    );

    CREATE TABLE IF NOT EXISTS metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        name TEXT NOT NULL,
        value REAL NOT NULL,
        step INTEGER NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_metrics_run ON metrics(run_id, name, id);

    CREATE TABLE IF NOT EXISTS params (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_params_run ON params(run_id, id);

    CREATE TABLE IF NOT EXISTS tags (
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (run_id, name)
    );";

fn db_err(e: rusqlite::Error) -> SluiceError {
    SluiceError::Database(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SluiceError::Database(format!("bad timestamp '{}': {}", s, e)))
}

/// SQLite-backed run/metric/param/tag store.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SluiceError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Metadata store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an existing database without creating, migrating or writing to it.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(db_err)?;
        debug!(path = %path.display(), "Metadata store opened read-only");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SluiceError::Database(e.to_string()))
    }
}

impl MetadataBackend for SqliteMetadataStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (run_id, epoch, started_at, ended_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                run.run_id.0,
                run.epoch as i64,
                run.started_at.to_rfc3339(),
                run.ended_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn close_run(&self, run_id: &RunId, ended_at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE runs SET ended_at = ?2 WHERE run_id = ?1",
                params![run_id.0, ended_at.to_rfc3339()],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(SluiceError::Database(format!("unknown run: {}", run_id)));
        }
        Ok(())
    }

    fn insert_metric(&self, entry: &MetricEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO metrics (run_id, name, value, step, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.run_id.0,
                entry.name,
                entry.value,
                entry.step as i64,
                entry.timestamp.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn insert_param(&self, entry: &ParamEntry) -> Result<()> {
        let value = serde_json::to_string(&entry.value)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO params (run_id, name, value, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![entry.run_id.0, entry.name, value, entry.timestamp.to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn upsert_tag(&self, entry: &TagEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tags (run_id, name, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id, name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![
                entry.run_id.0,
                entry.name,
                entry.value,
                entry.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn runs(&self) -> Result<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT run_id, epoch, started_at, ended_at FROM runs ORDER BY rowid ASC")
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                let run_id: String = row.get(0)?;
                let epoch: i64 = row.get(1)?;
                let started: String = row.get(2)?;
                let ended: Option<String> = row.get(3)?;
                Ok((run_id, epoch, started, ended))
            })
            .map_err(db_err)?;

        let mut runs = Vec::new();
        for row in rows {
            let (run_id, epoch, started, ended) = row.map_err(db_err)?;
            runs.push(RunRecord {
                run_id: RunId(run_id),
                epoch: epoch as u64,
                started_at: parse_ts(&started)?,
                ended_at: ended.as_deref().map(parse_ts).transpose()?,
            });
        }
        Ok(runs)
    }

    fn metrics(&self, run_id: Option<&RunId>) -> Result<Vec<MetricEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, name, value, step, timestamp FROM metrics
                 WHERE ?1 IS NULL OR run_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![run_id.map(|r| r.0.as_str())], |row| {
                let run_id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let value: f64 = row.get(2)?;
                let step: i64 = row.get(3)?;
                let ts: String = row.get(4)?;
                Ok((run_id, name, value, step, ts))
            })
            .map_err(db_err)?;

        let mut metrics = Vec::new();
        for row in rows {
            let (run_id, name, value, step, ts) = row.map_err(db_err)?;
            metrics.push(MetricEntry {
                run_id: RunId(run_id),
                name,
                value,
                step: step as u64,
                timestamp: parse_ts(&ts)?,
            });
        }
        Ok(metrics)
    }

    fn params(&self, run_id: Option<&RunId>) -> Result<Vec<ParamEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, name, value, timestamp FROM params
                 WHERE ?1 IS NULL OR run_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![run_id.map(|r| r.0.as_str())], |row| {
                let run_id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let value: String = row.get(2)?;
                let ts: String = row.get(3)?;
                Ok((run_id, name, value, ts))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (run_id, name, value, ts) = row.map_err(db_err)?;
            out.push(ParamEntry {
                run_id: RunId(run_id),
                name,
                value: serde_json::from_str(&value)?,
                timestamp: parse_ts(&ts)?,
            });
        }
        Ok(out)
    }

    fn tags(&self, run_id: Option<&RunId>) -> Result<Vec<TagEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, name, value, updated_at FROM tags
                 WHERE ?1 IS NULL OR run_id = ?1
                 ORDER BY rowid ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![run_id.map(|r| r.0.as_str())], |row| {
                let run_id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let value: String = row.get(2)?;
                let ts: String = row.get(3)?;
                Ok((run_id, name, value, ts))
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (run_id, name, value, ts) = row.map_err(db_err)?;
            out.push(TagEntry {
                run_id: RunId(run_id),
                name,
                value,
                updated_at: parse_ts(&ts)?,
            });
        }
        Ok(out)
    }

    fn metric_count(&self, run_id: &RunId, name: &str) -> Result<u64> {
        let conn = self.lock()?;
        let count: Option<i64> = conn
            .query_row(
                "SELECT COUNT(*) FROM metrics WHERE run_id = ?1 AND name = ?2",
                params![run_id.0, name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(count.unwrap_or(0) as u64)
    }
}
