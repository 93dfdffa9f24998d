//! Schema definition and migrations
//!
//! The `schema_version` table holds a single monotonically increasing
//! version; migrations with a higher version than the stored one are
//! applied in order inside a transaction. Layout changes require a new
//! migration entry, never an edit of an existing one.

use rusqlite::Connection;

use super::StoreError;

/// A single schema migration step.
struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: r#"
        CREATE TABLE samples (
            ts             INTEGER NOT NULL,
            host           TEXT    NOT NULL,
            cpu_pct        REAL    NOT NULL,
            mem_pct        REAL    NOT NULL,
            disk_read_bps  REAL    NOT NULL,
            disk_write_bps REAL    NOT NULL,
            net_up_bps     REAL    NOT NULL,
            net_down_bps   REAL    NOT NULL,
            swap_pct       REAL    NOT NULL,
            proc_count     INTEGER NOT NULL,
            cpu_temp       REAL,
            PRIMARY KEY (host, ts)
        );

        CREATE INDEX idx_samples_ts ON samples(ts);

        CREATE TABLE models (
            name       TEXT PRIMARY KEY,
            algo       TEXT    NOT NULL,
            version    TEXT    NOT NULL,
            trained_at INTEGER NOT NULL,
            meta_json  TEXT,
            blob       BLOB    NOT NULL
        );

        CREATE TABLE events (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            ts          INTEGER NOT NULL,
            type        TEXT    NOT NULL,
            score       REAL,
            metric_tags TEXT    NOT NULL,
            explanation TEXT    NOT NULL
        );

        CREATE INDEX idx_events_ts ON events(ts);
        CREATE INDEX idx_events_type ON events(type);
    "#,
}];

/// Latest schema version shipped with this binary.
pub const SCHEMA_VERSION: i64 = 1;

/// Apply all pending migrations.
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
    )?;

    let current: i64 = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i64>>(0)
        })?
        .unwrap_or(0);

    if current > SCHEMA_VERSION {
        return Err(StoreError::Schema(format!(
            "store schema version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )?;
        tx.commit()?;
        tracing::info!(version = migration.version, "applied schema migration");
    }

    Ok(())
}

/// Current schema version stored in the database.
pub fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let version: i64 = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i64>>(0)
        })?
        .unwrap_or(0);
    Ok(version)
}
