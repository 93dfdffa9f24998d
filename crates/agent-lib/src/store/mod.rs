//! SQLite storage layer
//!
//! WAL journaling so readers run concurrently with the single writer.
//! Three tables: `samples` (time series), `models` (opaque blobs with
//! versioned metadata), `events` (anomaly / forecast / threshold
//! occurrences), plus a monotonic `schema_version` row.

pub mod schema;

use crate::models::{Event, EventKind, ModelAlgo, ModelRecord, Sample};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Upper bound on any single store operation.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Page-cache budget, in KiB (negative cache_size pragma units).
const PAGE_CACHE_KIB: i64 = 65_536;

/// Storage errors. `Busy` is retryable; everything else surfaces.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store busy: {0}")]
    Busy(rusqlite::Error),

    #[error("store error: {0}")]
    Fatal(rusqlite::Error),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("model metadata error: {0}")]
    Meta(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy)
            | Some(rusqlite::ErrorCode::DatabaseLocked) => StoreError::Busy(err),
            _ => StoreError::Fatal(err),
        }
    }
}

impl StoreError {
    /// True for transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

/// Row counts for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    pub samples: u64,
    pub events: u64,
    pub models: u64,
}

/// Shared storage handle. Cloning is cheap; all clones serialize access
/// through one connection, and WAL keeps concurrent readers unblocked.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the database at `path` with WAL journaling and the
    /// performance pragmas applied, then run pending migrations.
    pub fn open(path: &Path, wal_checkpoint_interval: u32) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA temp_store=MEMORY;\n\
             PRAGMA cache_size=-{PAGE_CACHE_KIB};\n\
             PRAGMA wal_autocheckpoint={wal_checkpoint_interval};"
        ))?;

        schema::migrate(&conn)?;
        info!(path = %path.display(), "store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Current schema version.
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        schema::current_version(&conn)
    }

    // ------------------------------------------------------------------
    // Samples
    // ------------------------------------------------------------------

    /// Insert a batch of samples in one transaction. A duplicate
    /// `(host, ts)` replaces the earlier row so the uniqueness invariant
    /// holds even with sub-second cadence.
    pub fn insert_samples(&self, samples: &[Sample]) -> Result<usize, StoreError> {
        if samples.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO samples (
                     ts, host, cpu_pct, mem_pct, disk_read_bps, disk_write_bps,
                     net_up_bps, net_down_bps, swap_pct, proc_count, cpu_temp
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for s in samples {
                stmt.execute(params![
                    s.ts,
                    s.host,
                    s.cpu_pct,
                    s.mem_pct,
                    s.disk_read_bps,
                    s.disk_write_bps,
                    s.net_up_bps,
                    s.net_down_bps,
                    s.swap_pct,
                    s.proc_count,
                    s.cpu_temp,
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = samples.len(), "inserted sample batch");
        Ok(samples.len())
    }

    /// Samples with `from <= ts <= to`, ascending by `ts`.
    pub fn read_samples(
        &self,
        from: i64,
        to: i64,
        host: Option<&str>,
    ) -> Result<Vec<Sample>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT ts, host, cpu_pct, mem_pct, disk_read_bps, disk_write_bps,
                    net_up_bps, net_down_bps, swap_pct, proc_count, cpu_temp
             FROM samples WHERE ts BETWEEN ?1 AND ?2",
        );
        if host.is_some() {
            sql.push_str(" AND host = ?3");
        }
        sql.push_str(" ORDER BY ts ASC");

        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = match host {
            Some(host) => stmt.query_map(params![from, to, host], row_to_sample)?,
            None => stmt.query_map(params![from, to], row_to_sample)?,
        };
        collect_rows(rows)
    }

    pub fn count_samples(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Latest `n` samples, ascending by `ts`.
    pub fn latest_samples(&self, n: usize) -> Result<Vec<Sample>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT ts, host, cpu_pct, mem_pct, disk_read_bps, disk_write_bps,
                    net_up_bps, net_down_bps, swap_pct, proc_count, cpu_temp
             FROM (SELECT * FROM samples ORDER BY ts DESC LIMIT ?1)
             ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map([n as i64], row_to_sample)?;
        collect_rows(rows)
    }

    /// Most recent sample for each host.
    pub fn latest_sample_per_host(&self) -> Result<Vec<Sample>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT s.ts, s.host, s.cpu_pct, s.mem_pct, s.disk_read_bps, s.disk_write_bps,
                    s.net_up_bps, s.net_down_bps, s.swap_pct, s.proc_count, s.cpu_temp
             FROM samples s
             JOIN (SELECT host, MAX(ts) AS max_ts FROM samples GROUP BY host) latest
               ON s.host = latest.host AND s.ts = latest.max_ts
             ORDER BY s.host",
        )?;
        let rows = stmt.query_map([], row_to_sample)?;
        collect_rows(rows)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Insert an event, returning its assigned id.
    pub fn write_event(&self, event: &Event) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (ts, type, score, metric_tags, explanation)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.ts,
                event.kind.as_str(),
                event.score,
                event.metric_tags,
                event.explanation,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Events with `from <= ts <= to`, newest first, optionally filtered
    /// by kind.
    pub fn read_events(
        &self,
        from: i64,
        to: i64,
        kind: Option<EventKind>,
    ) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT id, ts, type, score, metric_tags, explanation
             FROM events WHERE ts BETWEEN ?1 AND ?2",
        );
        if kind.is_some() {
            sql.push_str(" AND type = ?3");
        }
        sql.push_str(" ORDER BY ts DESC, id DESC");

        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = match kind {
            Some(kind) => stmt.query_map(params![from, to, kind.as_str()], row_to_event)?,
            None => stmt.query_map(params![from, to], row_to_event)?,
        };
        collect_rows(rows)
    }

    /// Highest event id currently assigned; 0 when the table is empty.
    pub fn last_event_id(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let id: Option<i64> =
            conn.query_row("SELECT MAX(id) FROM events", [], |row| row.get(0))?;
        Ok(id.unwrap_or(0))
    }

    /// Events with id greater than `after_id`, ascending by id. Lets the
    /// rule engine consume each event exactly once.
    pub fn events_after(&self, after_id: i64, limit: usize) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts, type, score, metric_tags, explanation
             FROM events WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_id, limit as i64], row_to_event)?;
        collect_rows(rows)
    }

    // ------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------

    /// Atomically save (insert-or-replace) a model record.
    pub fn save_model(&self, record: &ModelRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let meta_json = serde_json::to_string(&record.meta)?;
        conn.execute(
            "INSERT OR REPLACE INTO models (name, algo, version, trained_at, meta_json, blob)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.name,
                record.algo.as_str(),
                record.version,
                record.trained_at,
                meta_json,
                record.blob,
            ],
        )?;
        info!(name = %record.name, algo = record.algo.as_str(), version = %record.version, "model saved");
        Ok(())
    }

    /// Load a model record by name. A single SELECT, so readers never
    /// observe a partial blob.
    pub fn load_model(&self, name: &str) -> Result<Option<ModelRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT name, algo, version, trained_at, meta_json, blob
                 FROM models WHERE name = ?1",
                [name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                    ))
                },
            )
            .optional()?;

        match record {
            None => Ok(None),
            Some((name, algo, version, trained_at, meta_json, blob)) => {
                let algo: ModelAlgo = algo
                    .parse()
                    .map_err(|e: String| StoreError::Schema(e))?;
                let meta = match meta_json {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => serde_json::Value::Null,
                };
                Ok(Some(ModelRecord {
                    name,
                    algo,
                    version,
                    trained_at,
                    meta,
                    blob,
                }))
            }
        }
    }

    /// Training timestamp of a stored model, without loading the blob.
    /// Lets callers cache deserialized models cheaply.
    pub fn model_trained_at(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let trained_at = conn
            .query_row(
                "SELECT trained_at FROM models WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(trained_at)
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Delete samples and events older than the retention window, then
    /// checkpoint the WAL. One DELETE per table; the write lock is held
    /// only briefly and WAL keeps readers unblocked throughout.
    pub fn prune(&self, retention_days: u32, now: i64) -> Result<(u64, u64), StoreError> {
        let cutoff = now - i64::from(retention_days) * 86_400;
        let conn = self.conn.lock().unwrap();

        let samples = conn.execute("DELETE FROM samples WHERE ts < ?1", [cutoff])? as u64;
        let events = conn.execute("DELETE FROM events WHERE ts < ?1", [cutoff])? as u64;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;

        if samples > 0 || events > 0 {
            info!(samples, events, retention_days, "pruned expired rows");
        }
        Ok((samples, events))
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock().unwrap();
        let samples: i64 = conn.query_row("SELECT COUNT(*) FROM samples", [], |r| r.get(0))?;
        let events: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        let models: i64 = conn.query_row("SELECT COUNT(*) FROM models", [], |r| r.get(0))?;
        Ok(StoreStats {
            samples: samples as u64,
            events: events as u64,
            models: models as u64,
        })
    }
}

/// Major component of a semver string, used to reject incompatible
/// model blobs.
pub fn semver_major(version: &str) -> Option<u64> {
    version.split('.').next()?.parse().ok()
}

fn row_to_sample(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sample> {
    Ok(Sample {
        ts: row.get(0)?,
        host: row.get(1)?,
        cpu_pct: row.get(2)?,
        mem_pct: row.get(3)?,
        disk_read_bps: row.get(4)?,
        disk_write_bps: row.get(5)?,
        net_up_bps: row.get(6)?,
        net_down_bps: row.get(7)?,
        swap_pct: row.get(8)?,
        proc_count: row.get(9)?,
        cpu_temp: row.get(10)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let kind_raw: String = row.get(2)?;
    let kind = kind_raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    Ok(Event {
        id: Some(row.get(0)?),
        ts: row.get(1)?,
        kind,
        score: row.get(3)?,
        metric_tags: row.get(4)?,
        explanation: row.get(5)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
